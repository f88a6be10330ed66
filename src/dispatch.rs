//! Resolution of competing operation requests.
//!
//! A [`Dispatch`] batches four kinds of requests: speculative starts,
//! explicit starts, forced restarts and resets. [`Runtime::dispatch`] resolves
//! the batch in a single synchronous pass into the minimal set of operations
//! and performs them in a fixed order:
//!
//! 1. resets (and the stops that precede a restart),
//! 2. speculative starts,
//! 3. explicit and forced starts,
//! 4. promotions of speculative runs to explicit ones.
//!
//! When one task appears under several kinds, reset pairs with whichever
//! start was requested and the start kinds rank forced restart, explicit
//! start, speculative start.

use std::collections::{HashMap, HashSet};

use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use tokio_util::sync::CancellationToken;

use crate::error::TaskError;
use crate::runtime::Runtime;
use crate::task::{Outcome, RunOptions, RunResult, State, Task, TaskId};

/// Operation requested for a single task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Prerun,
    Run,
    Rerun,
    Stop,
}

/// A batch of requests, alive for one resolution pass.
#[derive(Default)]
pub struct Dispatch {
    /// Every task mentioned, in call order.
    order: Vec<Task>,
    prerun: HashSet<TaskId>,
    run: HashSet<TaskId>,
    rerun: HashSet<TaskId>,
    reset: HashSet<TaskId>,
    cancel: HashMap<TaskId, CancellationToken>,
    reason: Option<String>,
    keep_data: bool,
}

impl Dispatch {
    pub fn new() -> Self {
        Self::default()
    }

    fn add(&mut self, task: &Task) -> TaskId {
        if !self.order.contains(task) {
            self.order.push(task.clone());
        }
        task.id()
    }

    pub fn prerun(mut self, task: &Task) -> Self {
        let id = self.add(task);
        self.prerun.insert(id);
        self
    }

    pub fn run(mut self, task: &Task) -> Self {
        let id = self.add(task);
        self.run.insert(id);
        self
    }

    pub fn rerun(mut self, task: &Task) -> Self {
        let id = self.add(task);
        self.rerun.insert(id);
        self
    }

    pub fn reset(mut self, task: &Task) -> Self {
        let id = self.add(task);
        self.reset.insert(id);
        self
    }

    /// Extra cancellation source for the run started for `task`.
    pub fn cancel_with(mut self, task: &Task, token: CancellationToken) -> Self {
        let id = self.add(task);
        self.cancel.insert(id, token);
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Resets in this batch keep the previous data.
    pub fn keep_data(mut self) -> Self {
        self.keep_data = true;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn tasks(&self) -> &[Task] {
        &self.order
    }

    /// Shorthand used by the single-task methods on [`Task`].
    pub(crate) fn single(task: &Task, method: Method, options: &RunOptions) -> Self {
        let mut dispatch = Dispatch::new();
        dispatch = match method {
            Method::Prerun => dispatch.prerun(task),
            Method::Run => dispatch.run(task),
            Method::Rerun => dispatch.rerun(task),
            Method::Stop => dispatch.reset(task),
        };

        if let Some(token) = &options.cancel {
            dispatch = dispatch.cancel_with(task, token.clone());
        }
        if let Some(reason) = &options.reason {
            dispatch = dispatch.reason(reason.clone());
        }
        if options.keep_data {
            dispatch = dispatch.keep_data();
        }
        dispatch
    }
}

/// What a dispatch produced.
pub struct Dispatched {
    /// Outcomes of the tasks started or promoted by this call, in call order.
    /// Fails with the first failure nobody handled.
    pub requested: BoxFuture<'static, Result<Vec<Outcome>, TaskError>>,
    /// Outcomes of the requested tasks and of every other run in flight at
    /// dispatch time. Never fails as a whole.
    pub all_settled: BoxFuture<'static, Vec<RunResult>>,
    /// Tasks running after the dispatch: those of the batch in call order,
    /// then every other task with a run in flight.
    pub running: Vec<Task>,
}

#[derive(Default)]
struct Resolution {
    resets: Vec<Task>,
    restarts: Vec<Task>,
    speculative: Vec<Task>,
    explicit: Vec<Task>,
    promotions: Vec<Task>,
    untouched: Vec<Task>,
}

impl Dispatch {
    fn resolve(&self) -> Resolution {
        let mut plan = Resolution::default();

        for task in &self.order {
            let id = task.id();
            let snapshot = task.snapshot();
            let state = snapshot.state;

            let resetting = self.reset.contains(&id) && task.needs_reset(self.keep_data);
            if resetting {
                plan.resets.push(task.clone());
            }

            if self.rerun.contains(&id) {
                if state == State::Running && !resetting && task.is_pending_start() {
                    // The pending run has not reached its callback yet.
                    plan.promotions.push(task.clone());
                } else {
                    if !resetting && state != State::Idle {
                        plan.restarts.push(task.clone());
                    }
                    plan.explicit.push(task.clone());
                }
            } else if self.run.contains(&id) {
                match state {
                    _ if resetting => plan.explicit.push(task.clone()),
                    State::Running | State::Completed if snapshot.is_prerun => {
                        plan.promotions.push(task.clone())
                    }
                    State::Running => plan.untouched.push(task.clone()),
                    State::Completed => {}
                    State::Idle => plan.explicit.push(task.clone()),
                    State::Failed | State::Aborted => {
                        plan.restarts.push(task.clone());
                        plan.explicit.push(task.clone());
                    }
                }
            } else if self.prerun.contains(&id) {
                match state {
                    _ if resetting => plan.speculative.push(task.clone()),
                    State::Idle => plan.speculative.push(task.clone()),
                    State::Aborted => {
                        plan.restarts.push(task.clone());
                        plan.speculative.push(task.clone());
                    }
                    State::Running => plan.untouched.push(task.clone()),
                    State::Completed | State::Failed => {}
                }
            }
        }

        plan
    }
}

impl Runtime {
    /// Resolves and performs a batch of requests.
    pub fn dispatch(&self, request: Dispatch) -> Dispatched {
        let reason = request.reason.as_deref().unwrap_or("dispatch");
        let plan = request.resolve();

        tracing::debug!(
            reason,
            reset = plan.resets.len(),
            restart = plan.restarts.len(),
            prerun = plan.speculative.len(),
            run = plan.explicit.len(),
            promote = plan.promotions.len(),
            "dispatch resolved"
        );

        for task in &plan.resets {
            task.perform_stop(request.keep_data, reason);
        }
        for task in &plan.restarts {
            task.perform_stop(true, reason);
        }

        let mut pending = HashMap::new();
        for task in &plan.speculative {
            let cancel = request.cancel.get(&task.id()).cloned();
            pending.insert(task.id(), task.perform_run(true, cancel));
        }
        for task in &plan.explicit {
            let cancel = request.cancel.get(&task.id()).cloned();
            pending.insert(task.id(), task.perform_run(false, cancel));
        }
        for task in &plan.promotions {
            pending.insert(task.id(), task.promote().shared());
        }

        let requested: Vec<_> = request
            .order
            .iter()
            .filter_map(|task| pending.remove(&task.id()))
            .collect();

        // Runs in flight that this batch neither started nor named.
        let batch: HashSet<TaskId> = request.order.iter().map(Task::id).collect();
        let others: Vec<Task> = self
            .running()
            .into_iter()
            .filter(|task| !batch.contains(&task.id()))
            .collect();

        let mut settled = requested.clone();
        settled.extend(plan.untouched.iter().chain(&others).filter_map(Task::in_flight));

        let running = request
            .order
            .iter()
            .chain(&others)
            .filter(|task| task.state() == State::Running)
            .cloned()
            .collect();

        Dispatched {
            requested: join_all(requested)
                .map(|results| results.into_iter().collect::<Result<Vec<_>, _>>())
                .boxed(),
            all_settled: join_all(settled).boxed(),
            running,
        }
    }

    /// Dispatches a single request for a single task.
    pub fn dispatch_one(&self, task: &Task, method: Method, options: RunOptions) -> Dispatched {
        self.dispatch(Dispatch::single(task, method, &options))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::value::Value;

    fn counting(runtime: &Runtime, name: &'static str, counter: Arc<AtomicUsize>) -> Task {
        runtime.task().name(name).run(move |_| {
            let counter = counter.clone();
            async move {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(Value::from(n as i64))
            }
        })
    }

    #[tokio::test]
    async fn test_rerun_outranks_run() {
        let runtime = Runtime::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, "t", counter.clone());
        task.run(RunOptions::default()).await.unwrap();

        let both = runtime.dispatch(Dispatch::new().run(&task).rerun(&task));
        let outcomes = both.requested.await.unwrap();
        assert_eq!(outcomes.len(), 1);
        assert_eq!(counter.load(Ordering::SeqCst), 2);

        let alone = runtime.dispatch(Dispatch::new().rerun(&task));
        alone.requested.await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_explicit_outranks_speculative() {
        let runtime = Runtime::default();
        let task = counting(&runtime, "t", Arc::default());

        let dispatched = runtime.dispatch(Dispatch::new().prerun(&task).run(&task));
        assert!(!task.is_prerun());
        assert!(!runtime.prerun().is_protected(&task));
        assert_eq!(dispatched.running, vec![task.clone()]);
        dispatched.requested.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_then_start() {
        let runtime = Runtime::default();
        let counter = Arc::new(AtomicUsize::new(0));
        let task = counting(&runtime, "t", counter.clone());
        task.run(RunOptions::default()).await.unwrap();
        assert_eq!(task.data(), Some(Value::from(1i64)));

        let dispatched = runtime.dispatch(Dispatch::new().reset(&task).prerun(&task));
        assert_eq!(task.state(), State::Running);
        assert!(task.is_prerun());
        assert_eq!(task.data(), None);

        dispatched.requested.await.unwrap();
        assert_eq!(task.data(), Some(Value::from(2i64)));
    }

    #[tokio::test]
    async fn test_reset_only() {
        let runtime = Runtime::default();
        let task = counting(&runtime, "t", Arc::default());
        let idle = counting(&runtime, "idle", Arc::default());
        task.run(RunOptions::default()).await.unwrap();

        let dispatched = runtime.dispatch(Dispatch::new().reset(&task).reset(&idle));
        assert!(dispatched.requested.await.unwrap().is_empty());
        assert_eq!(task.state(), State::Idle);
        assert_eq!(idle.state(), State::Idle);
    }

    #[tokio::test]
    async fn test_untouched_running_is_folded_in() {
        let runtime = Runtime::default();
        let busy = counting(&runtime, "busy", Arc::default());
        let fresh = counting(&runtime, "fresh", Arc::default());

        let first = busy.run(RunOptions::default());
        let dispatched = runtime.dispatch(Dispatch::new().run(&busy).run(&fresh));

        assert_eq!(dispatched.running, vec![busy.clone(), fresh.clone()]);
        let all = dispatched.all_settled.await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|result| result.is_ok()));
        first.await.unwrap();
    }

    #[tokio::test]
    async fn test_reset_clears_data_kept_by_earlier_reset() {
        let runtime = Runtime::default();
        let task = counting(&runtime, "t", Arc::default());
        task.run(RunOptions::default()).await.unwrap();

        runtime.dispatch(Dispatch::new().reset(&task).keep_data());
        assert_eq!(task.state(), State::Idle);
        assert_eq!(task.data(), Some(Value::from(1i64)));
        assert!(!task.needs_reset(true));
        assert!(task.needs_reset(false));

        runtime.dispatch(Dispatch::new().reset(&task));
        assert_eq!(task.state(), State::Idle);
        assert_eq!(task.data(), None);
        assert!(!task.needs_reset(false));
    }

    #[tokio::test]
    async fn test_unrelated_run_is_folded_in() {
        let runtime = Runtime::default();
        let busy = counting(&runtime, "busy", Arc::default());
        let fresh = counting(&runtime, "fresh", Arc::default());

        let first = busy.run(RunOptions::default());
        let dispatched = runtime.dispatch(Dispatch::new().run(&fresh));

        assert_eq!(dispatched.running, vec![fresh.clone(), busy.clone()]);
        let all = dispatched.all_settled.await;
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|result| result.is_ok()));
        assert_eq!(dispatched.requested.await.unwrap().len(), 1);
        first.await.unwrap();

        let idle = runtime.dispatch(Dispatch::new().reset(&fresh));
        assert!(idle.running.is_empty());
        assert!(idle.all_settled.await.is_empty());
    }

    #[tokio::test]
    async fn test_requested_keeps_call_order() {
        let runtime = Runtime::default();
        let a = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Value::from("a"))
        });
        let b = runtime.task().run(|_| async { Ok(Value::from("b")) });

        let dispatched = runtime.dispatch(Dispatch::new().run(&a).rerun(&b));
        let outcomes = dispatched.requested.await.unwrap();
        let data: Vec<_> = outcomes.iter().filter_map(Outcome::data).cloned().collect();
        assert_eq!(data, vec![Value::from("a"), Value::from("b")]);
    }

    #[tokio::test]
    async fn test_failures_in_aggregates() {
        let runtime = Runtime::default();
        let ok = runtime.task().run(|_| async { Ok(Value::Null) });
        let bad = runtime.task().run(|_| async { Err(anyhow::anyhow!("bad")) });

        let dispatched = runtime.dispatch(Dispatch::new().run(&ok).run(&bad));
        let all = dispatched.all_settled.await;
        assert!(all[0].is_ok());
        assert!(all[1].is_err());

        ok.stop(RunOptions::default());
        bad.stop(RunOptions::default());
        let dispatched = runtime.dispatch(Dispatch::new().run(&ok).run(&bad));
        assert!(dispatched.requested.await.is_err());
    }

    #[tokio::test]
    async fn test_cancel_override() {
        let runtime = Runtime::default();
        let slow = runtime.task().run(|_| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(Value::Null)
        });

        let token = CancellationToken::new();
        let dispatched = runtime.dispatch(
            Dispatch::new()
                .run(&slow)
                .cancel_with(&slow, token.clone())
                .reason("test"),
        );
        token.cancel();

        let outcomes = dispatched.requested.await.unwrap();
        assert!(matches!(outcomes[0], Outcome::Aborted(_)));
    }

    #[tokio::test]
    async fn test_failed_task_restarts_on_run() {
        let runtime = Runtime::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let seen = attempts.clone();
        let flaky = runtime.task().on_error(|_, _| {}).run(move |_| {
            let n = seen.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err(anyhow::anyhow!("first attempt"))
                } else {
                    Ok(Value::from("second"))
                }
            }
        });

        assert!(matches!(
            flaky.run(RunOptions::default()).await.unwrap(),
            Outcome::Failed(_)
        ));
        assert!(matches!(
            flaky.prerun(RunOptions::default()).await.unwrap(),
            Outcome::Failed(_)
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        let outcome = flaky.run(RunOptions::default()).await.unwrap();
        assert_eq!(outcome.data(), Some(&Value::from("second")));
    }
}
