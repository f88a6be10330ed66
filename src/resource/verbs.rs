use std::future::Future;
use std::sync::Arc;

use crate::error::InvalidationError;
use crate::resource::{ResourceEngine, ResourceId, Store, Verb};
use crate::task::{Task, TaskContext};
use crate::value::Value;

impl ResourceEngine {
    /// Fetches one item. The result is written to the store.
    pub fn read<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::Read, callback)
    }

    /// Fetches a list of items. Every item is written to the store.
    pub fn read_many<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::ReadMany, callback)
    }

    pub fn create<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::Create, callback)
    }

    /// Partial write. The returned fields are merged into the stored item.
    pub fn update<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::Update, callback)
    }

    /// Full write. The returned item replaces the stored one.
    pub fn replace<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::Replace, callback)
    }

    /// The callback must yield an identifier, an item carrying one, or a list
    /// of those. Anything else fails the task.
    pub fn delete<F, Fut>(&self, resource: ResourceId, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.verb(resource, Verb::Delete, callback)
    }

    /// Builds a task tagged with `verb` whose completions feed the engine.
    pub fn verb<F, Fut>(&self, resource: ResourceId, verb: Verb, callback: F) -> Result<Task, InvalidationError>
    where
        F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        let (name, store) = {
            let registry = self.0.registry.lock().unwrap();
            let resource = registry.resource(resource)?;
            (resource.name.clone(), resource.store.clone())
        };

        let engine = Arc::downgrade(&self.0);
        let task = self
            .runtime()
            .task()
            .name(format!("{name}.{verb}"))
            .on_complete(move |task| {
                if let Some(inner) = engine.upgrade() {
                    ResourceEngine(inner).on_task_completed(task);
                }
            })
            .run(move |ctx| {
                let work = callback(ctx);
                let store = store.clone();
                let name = name.clone();
                async move {
                    let value = work.await?;
                    write(&*store, &name, verb, &value)?;
                    Ok(value)
                }
            });

        self.register_task(resource, verb, &task)?;
        Ok(task)
    }
}

/// Applies the result of a `verb` task to the store.
pub(crate) fn write(store: &dyn Store, resource: &str, verb: Verb, value: &Value) -> Result<(), InvalidationError> {
    match verb {
        Verb::Delete => {
            let ids = identifiers(store, value).ok_or_else(|| {
                InvalidationError::MalformedDeletion(resource.to_string(), value.to_string())
            })?;
            store.remove(&ids);
        }
        Verb::Update => {
            let merged: Vec<Value> = items(value)
                .into_iter()
                .map(|item| {
                    let existing = store.identify(&item).and_then(|id| store.select(&id));
                    match (existing, item.as_record()) {
                        (Some(existing), Some(fields)) => {
                            existing.extend(fields.iter().map(|(key, value)| (key, value.clone())))
                        }
                        _ => item,
                    }
                })
                .collect();
            store.upsert(&merged);
        }
        _ => store.upsert(&items(value)),
    }
    Ok(())
}

/// The records held by a task result.
pub(crate) fn items(value: &Value) -> Vec<Value> {
    match value {
        Value::List(list) => list.iter().filter(|item| item.as_record().is_some()).cloned().collect(),
        Value::Record(_) => vec![value.clone()],
        _ => Vec::new(),
    }
}

/// Identifiers named by a delete result, or `None` if it is malformed.
pub(crate) fn identifiers(store: &dyn Store, value: &Value) -> Option<Vec<Value>> {
    match value {
        Value::List(list) => list.iter().map(|item| identifier(store, item)).collect(),
        _ => identifier(store, value).map(|id| vec![id]),
    }
}

fn identifier(store: &dyn Store, value: &Value) -> Option<Value> {
    match value {
        Value::String(_) | Value::Number(_) => Some(value.clone()),
        Value::Record(_) => store.identify(value),
        _ => None,
    }
}

/// The item a single read is after, given its params.
pub(crate) fn target(store: &dyn Store, params: &Value) -> Option<Value> {
    match params {
        Value::Record(_) => store.identify(params),
        _ => identifier(store, params),
    }
}
