mod params;
mod reactive;
mod run;

use std::any::type_name;
use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::cache::{Ephemeral, EphemeronCache};
use crate::error::{AbortReason, TaskError};
use crate::runtime::Runtime;
use crate::value::Value;

pub use reactive::ReactiveTask;
pub(crate) use run::InFlight;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// Stable handle identity of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

impl TaskId {
    fn next() -> Self {
        TaskId(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    Idle,
    Running,
    Aborted,
    Failed,
    Completed,
}

impl State {
    /// Aborted, failed or completed.
    pub fn is_settled(self) -> bool {
        matches!(self, State::Aborted | State::Failed | State::Completed)
    }
}

/// Everything an observer can see of a task, published as one unit on every
/// transition.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub state: State,
    pub is_prerun: bool,
    /// Last successful result.
    pub data: Option<Value>,
    /// Last failure.
    pub error: Option<TaskError>,
    pub abort_reason: Option<AbortReason>,
}

/// How a run ended, as seen by a caller waiting on it.
#[derive(Debug, Clone)]
pub enum Outcome {
    Completed(Value),
    Aborted(AbortReason),
    /// A failure that was handled by an observer or an error handler.
    Failed(TaskError),
    /// The task was not started.
    Idle,
}

impl Outcome {
    pub fn data(&self) -> Option<&Value> {
        match self {
            Outcome::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// Result of waiting on a run. `Err` carries failures nobody handled.
pub type RunResult = Result<Outcome, TaskError>;

/// Per-call options for starting or stopping a task.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Extra cancellation source for this call. Firing it aborts the run.
    pub cancel: Option<CancellationToken>,
    /// Keep the previous data when the call resets the task.
    pub keep_data: bool,
    /// Human readable reason, used for logging and as the abort reason of a
    /// run cut short by a reset.
    pub reason: Option<String>,
}

impl RunOptions {
    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn keep_data(mut self) -> Self {
        self.keep_data = true;
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// The context passed to every task execution.
#[derive(Clone)]
pub struct TaskContext {
    /// Parameters of the task being run.
    pub params: Value,
    /// Fires when the run is aborted. Long running callbacks should watch it;
    /// the run is dropped at its next suspension point either way.
    pub token: CancellationToken,
    pub name: Arc<str>,
}

impl TaskContext {
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub(crate) trait TypedCallback: Send + Sync {
    type Future: Future<Output = anyhow::Result<Value>> + Send + 'static;

    fn get_name(&self) -> &'static str;

    fn call(&self, context: TaskContext) -> Self::Future;
}

pub(crate) trait Callback: Send + Sync {
    fn get_name(&self) -> &'static str;

    fn call(&self, context: TaskContext) -> BoxFuture<'static, anyhow::Result<Value>>;
}

// The typed side stays generic over the closure, this is where its future
// gets boxed.
impl<T> Callback for T
where
    T: TypedCallback,
{
    fn get_name(&self) -> &'static str {
        T::get_name(self)
    }

    fn call(&self, context: TaskContext) -> BoxFuture<'static, anyhow::Result<Value>> {
        Box::pin(T::call(self, context))
    }
}

struct FnCallback<F>(F);

impl<F, Fut> TypedCallback for FnCallback<F>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    type Future = Fut;

    fn get_name(&self) -> &'static str {
        type_name::<F>()
    }

    fn call(&self, context: TaskContext) -> Fut {
        (self.0)(context)
    }
}

pub(crate) type ErrorHandler = Arc<dyn Fn(&Task, &TaskError) + Send + Sync>;
pub(crate) type CompleteHook = Arc<dyn Fn(&Task) + Send + Sync>;

/// Options shared by a task and every child derived from it.
pub(crate) struct Options {
    pub name: Cow<'static, str>,
    pub initial_data: Option<Value>,
    pub speculative: bool,
    pub keep_data: bool,
    pub on_error: Option<ErrorHandler>,
    pub on_complete: Vec<CompleteHook>,
}

struct Cell {
    state: State,
    is_prerun: bool,
    data: Option<Value>,
    error: Option<TaskError>,
    abort_reason: Option<AbortReason>,
    run: Option<InFlight>,
    /// Bumped on every start and every reset; a settle from an older
    /// generation is ignored.
    generation: u64,
}

impl Cell {
    fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            is_prerun: self.is_prerun,
            data: self.data.clone(),
            error: self.error.clone(),
            abort_reason: self.abort_reason.clone(),
        }
    }
}

pub(crate) struct TaskInner {
    id: TaskId,
    name: Arc<str>,
    params: Value,
    callback: Arc<dyn Callback>,
    options: Arc<Options>,
    runtime: Runtime,
    parent: Weak<TaskInner>,
    children: Mutex<EphemeronCache<TaskInner>>,
    cell: Mutex<Cell>,
    snapshot: watch::Sender<Snapshot>,
}

impl Ephemeral for TaskInner {
    fn retains(&self, key: &Value) -> bool {
        self.params.same_allocation(key)
    }
}

impl TaskInner {
    fn new(
        runtime: Runtime,
        callback: Arc<dyn Callback>,
        options: Arc<Options>,
        params: Value,
        parent: Weak<TaskInner>,
    ) -> Self {
        let name: Arc<str> = match params {
            Value::Null => options.name.as_ref().into(),
            ref params => format!("{}({})", options.name, params).into(),
        };

        let cell = Cell {
            state: State::Idle,
            is_prerun: options.speculative,
            data: options.initial_data.clone(),
            error: None,
            abort_reason: None,
            run: None,
            generation: 0,
        };

        Self {
            id: TaskId::next(),
            name,
            params,
            callback,
            snapshot: watch::Sender::new(cell.snapshot()),
            cell: Mutex::new(cell),
            children: Mutex::new(EphemeronCache::new(runtime.config().sweep_interval)),
            options,
            runtime,
            parent,
        }
    }
}

/// A unit of cancellable asynchronous work.
///
/// `Task` is a cheap handle; clones refer to the same task. A task runs at
/// most once at a time and is destroyed only when it becomes unreachable.
#[derive(Clone)]
pub struct Task(pub(crate) Arc<TaskInner>);

impl Task {
    pub fn id(&self) -> TaskId {
        self.0.id
    }

    /// Diagnostic name derived from the callback and the params.
    pub fn name(&self) -> &Arc<str> {
        &self.0.name
    }

    pub fn params(&self) -> &Value {
        &self.0.params
    }

    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    pub fn snapshot(&self) -> Snapshot {
        self.0.cell.lock().unwrap().snapshot()
    }

    pub fn state(&self) -> State {
        self.0.cell.lock().unwrap().state
    }

    pub fn is_prerun(&self) -> bool {
        self.0.cell.lock().unwrap().is_prerun
    }

    pub fn data(&self) -> Option<Value> {
        self.0.cell.lock().unwrap().data.clone()
    }

    pub fn error(&self) -> Option<TaskError> {
        self.0.cell.lock().unwrap().error.clone()
    }

    /// Receives a [`Snapshot`] on every transition. While a receiver is
    /// alive, failures of this task count as handled.
    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.0.snapshot.subscribe()
    }

    pub(crate) fn is_observed(&self) -> bool {
        self.0.snapshot.receiver_count() > 0 || self.0.options.on_error.is_some()
    }

    pub fn parent(&self) -> Option<Task> {
        self.0.parent.upgrade().map(Task)
    }

    /// Live children derived through [`bind_params`](Self::bind_params).
    pub fn children(&self) -> Vec<Task> {
        self.0
            .children
            .lock()
            .unwrap()
            .iterate()
            .into_iter()
            .map(|(_, child)| Task(child))
            .collect()
    }
}

impl PartialEq for Task {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for Task {}

impl std::hash::Hash for Task {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .finish_non_exhaustive()
    }
}

/// The operations shared by concrete tasks and reactive proxies.
pub trait Action: Send + Sync {
    fn snapshot(&self) -> Snapshot;

    fn subscribe(&self) -> watch::Receiver<Snapshot>;

    fn prerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult>;

    fn run(&self, options: RunOptions) -> BoxFuture<'static, RunResult>;

    fn rerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult>;

    fn stop(&self, options: RunOptions);

    fn abort(&self, reason: &str);
}

impl Action for Task {
    fn snapshot(&self) -> Snapshot {
        Task::snapshot(self)
    }

    fn subscribe(&self) -> watch::Receiver<Snapshot> {
        Task::subscribe(self)
    }

    fn prerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        Task::prerun(self, options)
    }

    fn run(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        Task::run(self, options)
    }

    fn rerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        Task::rerun(self, options)
    }

    fn stop(&self, options: RunOptions) {
        Task::stop(self, options)
    }

    fn abort(&self, reason: &str) {
        Task::abort(self, reason)
    }
}

/// Builder returned by [`Runtime::task`].
///
/// ```rust,no_run
/// # use sakiyomi::{Runtime, Config, Value};
/// let runtime = Runtime::new(Config::default());
/// let task = runtime
///     .task()
///     .name("greeting")
///     .run(|ctx| async move { Ok(Value::from(format!("hello {}", ctx.params))) });
/// ```
pub struct TaskDef {
    runtime: Runtime,
    name: Option<Cow<'static, str>>,
    params: Value,
    initial_data: Option<Value>,
    speculative: bool,
    keep_data: bool,
    on_error: Option<ErrorHandler>,
    on_complete: Vec<CompleteHook>,
}

impl TaskDef {
    pub(crate) fn new(runtime: Runtime) -> Self {
        Self {
            runtime,
            name: None,
            params: Value::Null,
            initial_data: None,
            speculative: true,
            keep_data: false,
            on_error: None,
            on_complete: Vec::new(),
        }
    }

    pub fn name(mut self, name: impl Into<Cow<'static, str>>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn params(mut self, params: impl Into<Value>) -> Self {
        self.params = params.into();
        self
    }

    /// Data the task holds before its first run and after a reset.
    pub fn initial_data(mut self, data: impl Into<Value>) -> Self {
        self.initial_data = Some(data.into());
        self
    }

    /// Whether an idle task counts as speculative-eligible. Defaults to true.
    pub fn speculative(mut self, speculative: bool) -> Self {
        self.speculative = speculative;
        self
    }

    /// Keep the previous data across resets.
    pub fn keep_data(mut self) -> Self {
        self.keep_data = true;
        self
    }

    /// Failures passed to `handler` count as handled and are not propagated.
    pub fn on_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&Task, &TaskError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(handler));
        self
    }

    /// Called after every completed run, once the new state is visible.
    pub fn on_complete<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Task) + Send + Sync + 'static,
    {
        self.on_complete.push(Arc::new(hook));
        self
    }

    pub fn run<F, Fut>(self, callback: F) -> Task
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let options = Options {
            name: self.name.unwrap_or(type_name::<F>().into()),
            initial_data: self.initial_data,
            speculative: self.speculative,
            keep_data: self.keep_data,
            on_error: self.on_error,
            on_complete: self.on_complete,
        };

        Task(Arc::new(TaskInner::new(
            self.runtime,
            Arc::new(FnCallback(callback)),
            Arc::new(options),
            self.params,
            Weak::new(),
        )))
    }
}
