use std::sync::Arc;

use tokio::sync::watch;

use crate::task::{ReactiveTask, Task, TaskInner};
use crate::value::Value;

impl Task {
    /// Returns the child task bound to `params`.
    ///
    /// Children are cached by structural equality of their params: binding
    /// an equal value again returns the same child for as long as either the
    /// child or the params are referenced somewhere.
    pub fn bind_params(&self, params: impl Into<Value>) -> Task {
        let params = params.into();
        let mut children = self.0.children.lock().unwrap();

        if let Some(child) = children.get(&params) {
            return Task(child);
        }

        let child = Arc::new(TaskInner::new(
            self.0.runtime.clone(),
            self.0.callback.clone(),
            self.0.options.clone(),
            params.clone(),
            Arc::downgrade(&self.0),
        ));
        children.set(params, child.clone());

        tracing::trace!("bound {}", child.name);
        Task(child)
    }

    /// Shallow-merges `partial` into the current params and binds the result
    /// on this task's parent (or on this task if it has none).
    ///
    /// A `partial` that is not a record replaces the params outright.
    pub fn replace_params(&self, partial: impl Into<Value>) -> Task {
        let partial = partial.into();
        let params = match partial.as_record() {
            Some(record) => self
                .0
                .params
                .extend(record.iter().map(|(key, value)| (key, value.clone()))),
            None => partial.clone(),
        };

        match self.parent() {
            Some(parent) => parent.bind_params(params),
            None => self.bind_params(params),
        }
    }

    /// Binds to a value that changes over time. The returned proxy follows
    /// whichever child matches the current value.
    pub fn bind_reactive(&self, source: watch::Receiver<Value>) -> ReactiveTask {
        ReactiveTask::new(self.clone(), source)
    }
}
