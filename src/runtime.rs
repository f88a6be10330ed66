use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};

use tokio_util::sync::CancellationToken;

use crate::core::{Config, ParamScope, ScopeInterner};
use crate::error::AbortReason;
use crate::prerun::PrerunRegistry;
use crate::task::{Task, TaskDef, TaskId, TaskInner};
use crate::value::Value;

/// The session-scoped cancellation source every run listens to.
#[derive(Clone)]
pub(crate) struct Session {
    pub token: CancellationToken,
    reason: Arc<OnceLock<AbortReason>>,
}

impl Session {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            reason: Arc::new(OnceLock::new()),
        }
    }

    pub(crate) fn reason(&self) -> AbortReason {
        self.reason
            .get()
            .cloned()
            .unwrap_or_else(|| AbortReason::new("session cancelled"))
    }
}

struct RuntimeInner {
    config: Config,
    session: Mutex<Session>,
    prerun: PrerunRegistry,
    scopes: Mutex<ScopeInterner>,
    /// Tasks with a run in flight.
    runs: Mutex<HashMap<TaskId, Weak<TaskInner>>>,
}

/// Process-wide state of the orchestration runtime.
///
/// Holds the session cancellation source, the prerun protection registry, the
/// parameter scope interner and the set of tasks with a run in flight. Cheap to clone; every task keeps a handle to
/// the runtime that created it. Starting runs requires a Tokio runtime.
#[derive(Clone)]
pub struct Runtime(Arc<RuntimeInner>);

impl Runtime {
    pub fn new(config: Config) -> Self {
        tracing::debug!("starting runtime with {config:?}");

        Self(Arc::new(RuntimeInner {
            prerun: PrerunRegistry::new(config.prerun_ttl),
            session: Mutex::new(Session::new()),
            scopes: Mutex::default(),
            runs: Mutex::default(),
            config,
        }))
    }

    pub fn config(&self) -> &Config {
        &self.0.config
    }

    /// Starts defining a new task.
    pub fn task(&self) -> TaskDef {
        TaskDef::new(self.clone())
    }

    pub fn prerun(&self) -> &PrerunRegistry {
        &self.0.prerun
    }

    /// Interns `value` as a parameter scope token.
    pub fn scope(&self, value: &Value) -> ParamScope {
        self.0.scopes.lock().unwrap().intern(value)
    }

    pub(crate) fn session(&self) -> Session {
        self.0.session.lock().unwrap().clone()
    }

    pub(crate) fn track(&self, task: &Task) {
        self.0.runs.lock().unwrap().insert(task.id(), Arc::downgrade(&task.0));
    }

    pub(crate) fn untrack(&self, task: &Task) {
        self.0.runs.lock().unwrap().remove(&task.id());
    }

    /// Tasks with a run in flight, oldest task first.
    pub(crate) fn running(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = {
            let mut runs = self.0.runs.lock().unwrap();
            runs.retain(|_, task| task.strong_count() > 0);
            runs.values().filter_map(Weak::upgrade).map(Task).collect()
        };
        tasks.sort_by_key(Task::id);
        tasks
    }

    /// Aborts every run in flight with `reason` and opens a fresh session for
    /// the runs started afterwards.
    pub fn abort_all(&self, reason: &str) {
        let old = std::mem::replace(&mut *self.0.session.lock().unwrap(), Session::new());
        let _ = old.reason.set(AbortReason::new(reason));
        old.token.cancel();

        tracing::info!("session aborted: {reason}");
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(Config::default())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.0.config)
            .field("protected", &self.0.prerun.len())
            .field("scopes", &self.0.scopes.lock().unwrap().len())
            .field("running", &self.0.runs.lock().unwrap().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_interned_per_runtime() {
        let runtime = Runtime::default();
        let a = runtime.scope(&json!({"project": 1}).into());
        let b = runtime.scope(&json!({"project": 1}).into());
        assert_eq!(a, b);

        let other = Runtime::default();
        assert_ne!(a, other.scope(&json!({"project": 1}).into()));
    }

    #[test]
    fn test_abort_all_replaces_session() {
        let runtime = Runtime::default();
        let before = runtime.session();
        runtime.abort_all("bye");

        assert!(before.token.is_cancelled());
        assert_eq!(before.reason().0.as_ref(), "bye");
        assert!(!runtime.session().token.is_cancelled());
    }
}
