//! The task state machine.
//!
//! ```text
//!            perform_run                 settle
//!   IDLE ───────────────▶ RUNNING ──────────────▶ COMPLETED | FAILED | ABORTED
//!    ▲                       │                              │
//!    └───────────────────────┴──────── perform_stop ────────┘
//! ```
//!
//! Every run is spawned on the Tokio runtime right away, so work starts
//! without anyone polling for it. Callers get a shared handle to the result.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, Shared};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::dispatch::Method;
use crate::error::{AbortReason, TaskError};
use crate::runtime::Session;
use crate::task::{Cell, Outcome, RunOptions, RunResult, State, Task, TaskContext};
use crate::value::Value;

pub(crate) type Pending = Shared<BoxFuture<'static, RunResult>>;

/// Bookkeeping of the run currently in flight.
pub(crate) struct InFlight {
    token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
    /// Set once the callback has been polled for the first time.
    begun: Arc<AtomicBool>,
    result: Pending,
}

enum Settlement {
    Value(Value),
    Error(anyhow::Error),
    Panic(String),
    Aborted,
}

impl Task {
    /// Speculatively starts the task. A result nobody consumes is kept alive
    /// for the configured prerun TTL.
    pub fn prerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.dispatch_one(Method::Prerun, options)
    }

    /// Starts the task unless it is already running or completed.
    pub fn run(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.dispatch_one(Method::Run, options)
    }

    /// Restarts the task even if it is running or completed.
    pub fn rerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.dispatch_one(Method::Rerun, options)
    }

    /// Resets the task to idle, aborting a run in flight.
    pub fn stop(&self, options: RunOptions) {
        drop(self.runtime().dispatch_one(self, Method::Stop, options));
    }

    /// Aborts the run in flight. The first recorded reason wins. Does nothing
    /// if the task is not running.
    pub fn abort(&self, reason: &str) {
        let cell = self.0.cell.lock().unwrap();
        if let Some(run) = &cell.run {
            let _ = run.reason.set(AbortReason::new(reason));
            run.token.cancel();
        }
    }

    fn dispatch_one(&self, method: Method, options: RunOptions) -> BoxFuture<'static, RunResult> {
        let dispatched = self.runtime().dispatch_one(self, method, options);
        let fallback = self.result();

        async move {
            match dispatched.requested.await?.into_iter().next() {
                Some(outcome) => Ok(outcome),
                None => fallback.await,
            }
        }
        .boxed()
    }

    /// The outcome of the current run, or of the last one if the task is
    /// settled.
    pub fn result(&self) -> BoxFuture<'static, RunResult> {
        let cell = self.0.cell.lock().unwrap();
        match &cell.run {
            Some(run) => run.result.clone().boxed(),
            None => futures_util::future::ready(self.settled_outcome(&cell)).boxed(),
        }
    }

    fn settled_outcome(&self, cell: &Cell) -> RunResult {
        match cell.state {
            State::Completed => Ok(Outcome::Completed(cell.data.clone().unwrap_or_default())),
            State::Aborted => Ok(Outcome::Aborted(
                cell.abort_reason
                    .clone()
                    .unwrap_or_else(|| AbortReason::new("aborted")),
            )),
            State::Failed => match &cell.error {
                Some(error) if self.is_observed() => Ok(Outcome::Failed(error.clone())),
                Some(error) => Err(error.clone()),
                None => Ok(Outcome::Idle),
            },
            State::Idle | State::Running => Ok(Outcome::Idle),
        }
    }

    fn publish(&self, cell: &Cell) {
        self.0.snapshot.send_replace(cell.snapshot());
    }

    pub(crate) fn in_flight(&self) -> Option<Pending> {
        let cell = self.0.cell.lock().unwrap();
        cell.run.as_ref().map(|run| run.result.clone())
    }

    /// True while the current run exists but its callback was never polled.
    pub(crate) fn is_pending_start(&self) -> bool {
        let cell = self.0.cell.lock().unwrap();
        cell.run
            .as_ref()
            .is_some_and(|run| !run.begun.load(Ordering::Acquire))
    }

    /// False when a reset would leave the task exactly as it is.
    pub(crate) fn needs_reset(&self, keep_data: bool) -> bool {
        let cell = self.0.cell.lock().unwrap();
        cell.state != State::Idle
            || (!(keep_data || self.0.options.keep_data) && cell.data != self.0.options.initial_data)
    }

    /// IDLE -> RUNNING. Joins the run in flight if there is one.
    pub(crate) fn perform_run(&self, speculative: bool, cancel: Option<CancellationToken>) -> Pending {
        let mut cell = self.0.cell.lock().unwrap();
        if let Some(run) = &cell.run {
            return run.result.clone();
        }

        cell.generation += 1;
        cell.state = State::Running;
        cell.is_prerun = speculative;
        cell.error = None;
        cell.abort_reason = None;

        let generation = cell.generation;
        let token = CancellationToken::new();
        let reason = Arc::new(OnceLock::new());
        let begun = Arc::new(AtomicBool::new(false));

        if speculative {
            self.runtime().prerun().protect(self);
        }

        let context = TaskContext {
            params: self.0.params.clone(),
            token: token.clone(),
            name: self.0.name.clone(),
        };

        let span = tracing::info_span!(
            "task",
            name = %self.0.name,
            callback = self.0.callback.get_name(),
            prerun = speculative
        );
        let handle = tokio::spawn(
            execute(
                self.clone(),
                generation,
                context,
                reason.clone(),
                begun.clone(),
                self.runtime().session(),
                cancel,
            )
            .instrument(span),
        );

        let name = self.0.name.clone();
        let result = async move {
            match handle.await {
                Ok(result) => result,
                Err(error) => {
                    tracing::error!("run of {name} was lost: {error}");
                    Ok(Outcome::Aborted(AbortReason::new("runtime shut down")))
                }
            }
        }
        .boxed()
        .shared();

        cell.run = Some(InFlight {
            token,
            reason,
            begun,
            result: result.clone(),
        });
        self.runtime().track(self);
        self.publish(&cell);

        result
    }

    /// Any state -> IDLE. Cancels the run in flight, clears the error, and
    /// clears the data unless `keep_data`.
    pub(crate) fn perform_stop(&self, keep_data: bool, reason: &str) {
        {
            let mut cell = self.0.cell.lock().unwrap();
            if let Some(run) = cell.run.take() {
                let _ = run.reason.set(AbortReason::new(reason));
                run.token.cancel();
                self.runtime().untrack(self);
            }

            cell.generation += 1;
            cell.state = State::Idle;
            cell.is_prerun = true;
            cell.error = None;
            cell.abort_reason = None;
            if !(keep_data || self.0.options.keep_data) {
                cell.data = self.0.options.initial_data.clone();
            }
            self.publish(&cell);
        }

        self.runtime().prerun().unprotect(self);
    }

    /// Marks a speculative run or result as explicitly demanded.
    pub(crate) fn promote(&self) -> BoxFuture<'static, RunResult> {
        let settled = {
            let mut cell = self.0.cell.lock().unwrap();
            if cell.is_prerun {
                cell.is_prerun = false;
                self.publish(&cell);
            }

            match &cell.run {
                Some(run) => return run.result.clone().boxed(),
                None => self.settled_outcome(&cell),
            }
        };

        self.runtime().prerun().unprotect(self);
        futures_util::future::ready(settled).boxed()
    }

    /// RUNNING -> COMPLETED | FAILED | ABORTED, applied as one observable unit.
    fn settle(&self, generation: u64, settlement: Settlement, reason: &OnceLock<AbortReason>) -> RunResult {
        let name = self.0.name.clone();
        let aborted = || {
            reason
                .get()
                .cloned()
                .unwrap_or_else(|| AbortReason::new("aborted"))
        };

        let outcome = {
            let mut cell = self.0.cell.lock().unwrap();
            if cell.generation != generation || cell.run.is_none() {
                // Superseded by a reset or a restart.
                return Ok(Outcome::Aborted(aborted()));
            }

            cell.run = None;
            self.runtime().untrack(self);
            let outcome = match settlement {
                Settlement::Value(value) => {
                    cell.state = State::Completed;
                    cell.data = Some(value.clone());
                    cell.error = None;
                    Outcome::Completed(value)
                }
                Settlement::Aborted => {
                    let reason = aborted();
                    cell.state = State::Aborted;
                    cell.abort_reason = Some(reason.clone());
                    Outcome::Aborted(reason)
                }
                Settlement::Error(error) => {
                    let error = TaskError::Failed(name.clone(), Arc::new(error));
                    cell.state = State::Failed;
                    cell.error = Some(error.clone());
                    Outcome::Failed(error)
                }
                Settlement::Panic(message) => {
                    let error = TaskError::Panicked(name.clone(), message);
                    cell.state = State::Failed;
                    cell.error = Some(error.clone());
                    Outcome::Failed(error)
                }
            };
            self.publish(&cell);
            outcome
        };

        self.runtime().prerun().unprotect(self);

        match outcome {
            Outcome::Completed(value) => {
                tracing::debug!("{name} completed");
                for hook in &self.0.options.on_complete {
                    hook(self);
                }
                Ok(Outcome::Completed(value))
            }
            Outcome::Aborted(reason) => {
                tracing::debug!("{name} aborted: {reason}");
                Ok(Outcome::Aborted(reason))
            }
            Outcome::Failed(error) if self.is_observed() => {
                tracing::warn!("{error}");
                if let Some(handler) = &self.0.options.on_error {
                    handler(self, &error);
                }
                Ok(Outcome::Failed(error))
            }
            Outcome::Failed(error) => Err(error),
            Outcome::Idle => Ok(Outcome::Idle),
        }
    }
}

async fn cancelled(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled().await,
        None => std::future::pending().await,
    }
}

async fn execute(
    task: Task,
    generation: u64,
    context: TaskContext,
    reason: Arc<OnceLock<AbortReason>>,
    begun: Arc<AtomicBool>,
    session: Session,
    cancel: Option<CancellationToken>,
) -> RunResult {
    let token = context.token.clone();
    let callback = task.0.callback.clone();

    // Nothing runs before the first poll, so a run cancelled before it got
    // scheduled never reaches the callback.
    let work = AssertUnwindSafe(async move {
        begun.store(true, Ordering::Release);
        callback.call(context).await
    })
    .catch_unwind();

    let settlement = tokio::select! {
        biased;

        _ = token.cancelled() => Settlement::Aborted,
        _ = session.token.cancelled() => {
            let _ = reason.set(session.reason());
            Settlement::Aborted
        }
        _ = cancelled(cancel) => {
            let _ = reason.set(AbortReason::new("cancelled by caller"));
            Settlement::Aborted
        }
        result = work => match result {
            Ok(Ok(value)) => Settlement::Value(value),
            Ok(Err(error)) => match error.downcast::<AbortReason>() {
                Ok(abort) => {
                    let _ = reason.set(abort);
                    Settlement::Aborted
                }
                Err(_) if token.is_cancelled() => Settlement::Aborted,
                Err(error) => Settlement::Error(error),
            },
            Err(panic) => {
                let message = if let Some(s) = panic.downcast_ref::<&str>() {
                    s.to_string()
                } else if let Some(s) = panic.downcast_ref::<String>() {
                    s.clone()
                } else {
                    String::from("unknown payload")
                };
                Settlement::Panic(message)
            }
        },
    };

    task.settle(generation, settlement, &reason)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::{Config, Runtime};

    fn counting(runtime: &Runtime, counter: Arc<AtomicUsize>) -> Task {
        runtime.task().name("count").run(move |ctx| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(10)).await;
                Ok(Value::record([("n", Value::from(n as i64)), ("params", ctx.params)]))
            }
        })
    }

    #[tokio::test]
    async fn test_run_lifecycle() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async { Ok(Value::from(42i64)) });
        let mut rx = task.subscribe();

        let pending = task.run(RunOptions::default());
        assert_eq!(task.state(), State::Running);
        assert!(!task.is_prerun());

        let outcome = pending.await.unwrap();
        assert_eq!(outcome.data(), Some(&Value::from(42i64)));
        assert_eq!(task.state(), State::Completed);
        assert_eq!(task.data(), Some(Value::from(42i64)));

        rx.changed().await.unwrap();
        assert_eq!(rx.borrow_and_update().state, State::Completed);
    }

    #[tokio::test]
    async fn test_concurrent_run_dedupes() {
        let runtime = Runtime::new(Config::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, counter.clone());

        let a = task.run(RunOptions::default());
        let b = task.run(RunOptions::default());
        let (a, b) = tokio::join!(a, b);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(a.unwrap().data(), b.unwrap().data());
    }

    #[tokio::test]
    async fn test_bound_rerun_twice_runs_once() {
        let runtime = Runtime::new(Config::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, counter.clone());

        let a = task.bind_params(json!({"id": 1})).rerun(RunOptions::default());
        let b = task.bind_params(json!({"id": 1})).rerun(RunOptions::default());
        let (a, b) = tokio::join!(a, b);

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(a.unwrap().data().is_some());
        assert!(b.unwrap().data().is_some());
    }

    #[tokio::test]
    async fn test_completed_run_is_not_repeated() {
        let runtime = Runtime::new(Config::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, counter.clone());

        task.run(RunOptions::default()).await.unwrap();
        let again = task.run(RunOptions::default()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(again.data().is_some());

        task.rerun(RunOptions::default()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unobserved_failure_propagates() {
        let runtime = Runtime::new(Config::default());
        let task = runtime
            .task()
            .name("boom")
            .run(|_| async { Err(anyhow::anyhow!("boom")) });

        let error = task.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(error, TaskError::Failed(..)));
        assert_eq!(task.state(), State::Failed);
        assert!(task.error().is_some());
    }

    #[tokio::test]
    async fn test_observed_failure_is_handled() {
        let runtime = Runtime::new(Config::default());
        let handled = Arc::new(AtomicUsize::new(0));
        let seen = handled.clone();
        let task = runtime
            .task()
            .on_error(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .run(|_| async { Err(anyhow::anyhow!("boom")) });

        let outcome = task.run(RunOptions::default()).await.unwrap();
        assert!(matches!(outcome, Outcome::Failed(_)));
        assert_eq!(handled.load(Ordering::SeqCst), 1);

        let subscribed = runtime.task().run(|_| async { Err(anyhow::anyhow!("boom")) });
        let _rx = subscribed.subscribe();
        assert!(subscribed.run(RunOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_panic_is_a_failure() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().name("panics").run(|_| async {
            if true {
                panic!("oops");
            }
            Ok(Value::Null)
        });

        let error = task.run(RunOptions::default()).await.unwrap_err();
        assert!(matches!(error, TaskError::Panicked(_, ref message) if message == "oops"));
    }

    #[tokio::test]
    async fn test_abort_wins_over_later_failure() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow::anyhow!("late failure"))
        });

        let pending = task.run(RunOptions::default());
        tokio::task::yield_now().await;
        task.abort("user left");
        task.abort("second reason");

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted(ref r) if r.0.as_ref() == "user left"));
        assert_eq!(task.state(), State::Aborted);
        assert!(task.error().is_none());
    }

    #[tokio::test]
    async fn test_abort_idle_is_noop() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async { Ok(Value::Null) });
        task.abort("nothing to abort");
        assert_eq!(task.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_callback_abort_reason() {
        let runtime = Runtime::new(Config::default());
        let task = runtime
            .task()
            .run(|_| async { Err(anyhow::Error::new(AbortReason::new("gave up"))) });

        let outcome = task.run(RunOptions::default()).await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted(ref r) if r.0.as_ref() == "gave up"));
    }

    #[tokio::test]
    async fn test_caller_cancellation() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

        let token = CancellationToken::new();
        let pending = task.run(RunOptions::default().cancel(token.clone()));
        token.cancel();

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted(_)));
        assert_eq!(task.state(), State::Aborted);
    }

    #[tokio::test]
    async fn test_session_abort() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

        let pending = task.run(RunOptions::default());
        runtime.abort_all("shutting down");

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted(ref r) if r.0.as_ref() == "shutting down"));

        // A fresh session lets the task run again.
        task.stop(RunOptions::default());
        let task_ok = runtime.task().run(|_| async { Ok(Value::Null) });
        assert!(matches!(
            task_ok.run(RunOptions::default()).await.unwrap(),
            Outcome::Completed(_)
        ));
    }

    #[tokio::test]
    async fn test_stop_resets() {
        let runtime = Runtime::new(Config::default());
        let task = runtime
            .task()
            .initial_data(Value::from("initial"))
            .run(|_| async { Ok(Value::from("loaded")) });

        task.run(RunOptions::default()).await.unwrap();
        assert_eq!(task.data(), Some(Value::from("loaded")));

        task.stop(RunOptions::default().keep_data());
        assert_eq!(task.state(), State::Idle);
        assert_eq!(task.data(), Some(Value::from("loaded")));

        task.stop(RunOptions::default());
        assert_eq!(task.state(), State::Idle);
        assert!(task.error().is_none());
        assert_eq!(task.data(), Some(Value::from("initial")));
        assert!(task.is_prerun());
    }

    #[tokio::test]
    async fn test_stop_aborts_running() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

        let pending = task.run(RunOptions::default());
        task.stop(RunOptions::default().reason("navigated away"));
        assert_eq!(task.state(), State::Idle);

        let outcome = pending.await.unwrap();
        assert!(matches!(outcome, Outcome::Aborted(ref r) if r.0.as_ref() == "navigated away"));
        assert_eq!(task.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_prerun_protection() {
        let runtime = Runtime::new(Config::default());
        let task = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(Value::Null)
        });

        let pending = task.prerun(RunOptions::default());
        assert!(task.is_prerun());
        assert!(runtime.prerun().is_protected(&task));

        pending.await.unwrap();
        assert!(!runtime.prerun().is_protected(&task));
        assert!(task.is_prerun());
    }

    #[tokio::test]
    async fn test_run_promotes_prerun() {
        let runtime = Runtime::new(Config::default());
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, counter.clone());

        let speculative = task.prerun(RunOptions::default());
        let explicit = task.run(RunOptions::default());
        assert!(!task.is_prerun());

        let (a, b) = tokio::join!(speculative, explicit);
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
