use std::sync::{Arc, Mutex, Weak};

use futures_util::future::BoxFuture;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};

use crate::task::{Action, RunOptions, RunResult, Snapshot, Task};
use crate::value::Value;

struct ReactiveInner {
    root: Task,
    target: Mutex<Task>,
    snapshot: watch::Sender<Snapshot>,
    _closed: DropGuard,
}

/// A proxy task bound to a changing parameter source.
///
/// Every operation goes to the child of `root` that matches the source's
/// current value. When the value changes the proxy re-targets itself;
/// receivers from [`subscribe`](Action::subscribe) keep working across the
/// switch and see the new target's state.
#[derive(Clone)]
pub struct ReactiveTask(Arc<ReactiveInner>);

impl ReactiveTask {
    pub(crate) fn new(root: Task, mut source: watch::Receiver<Value>) -> Self {
        let initial = source.borrow_and_update().clone();
        let target = root.bind_params(initial);
        let closed = CancellationToken::new();

        let inner = Arc::new(ReactiveInner {
            root,
            snapshot: watch::Sender::new(target.snapshot()),
            target: Mutex::new(target.clone()),
            _closed: closed.clone().drop_guard(),
        });

        tokio::spawn(follow(
            Arc::downgrade(&inner),
            source,
            target.subscribe(),
            closed,
        ));

        ReactiveTask(inner)
    }

    /// The concrete task currently behind the proxy.
    pub fn target(&self) -> Task {
        self.0.target.lock().unwrap().clone()
    }

    pub fn root(&self) -> &Task {
        &self.0.root
    }
}

async fn follow(
    inner: Weak<ReactiveInner>,
    mut source: watch::Receiver<Value>,
    mut target_rx: watch::Receiver<Snapshot>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            changed = source.changed() => {
                if changed.is_err() {
                    break;
                }
                let value = source.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else {
                    break;
                };

                let next = inner.root.bind_params(value);
                let mut target = inner.target.lock().unwrap();
                if *target != next {
                    tracing::debug!("retargeted {} -> {}", target.name(), next.name());
                    target_rx = next.subscribe();
                    inner.snapshot.send_replace(next.snapshot());
                    *target = next;
                }
            }
            changed = target_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = target_rx.borrow_and_update().clone();
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.snapshot.send_replace(snapshot);
            }
        }
    }
}

impl Action for ReactiveTask {
    fn snapshot(&self) -> Snapshot {
        self.0.snapshot.borrow().clone()
    }

    fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.0.snapshot.subscribe()
    }

    fn prerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.target().prerun(options)
    }

    fn run(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.target().run(options)
    }

    fn rerun(&self, options: RunOptions) -> BoxFuture<'static, RunResult> {
        self.target().rerun(options)
    }

    fn stop(&self, options: RunOptions) {
        self.target().stop(options)
    }

    fn abort(&self, reason: &str) {
        self.target().abort(reason)
    }
}
