//! Resource invalidation.
//!
//! A resource is a store plus the tasks that read and write it. When a
//! writing task completes, the engine works out which completed reads went
//! stale and dispatches reruns and resets for them.

mod store;
mod verbs;

use std::borrow::Cow;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::core::ParamScope;
use crate::dispatch::Dispatch;
use crate::error::InvalidationError;
use crate::runtime::Runtime;
use crate::task::{State, Task, TaskId};
use crate::value::Value;

pub use store::{MemoryStore, Store};

/// What a resource task does to its store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Read,
    ReadMany,
    Create,
    Update,
    Replace,
    Delete,
}

impl Verb {
    pub fn is_read(self) -> bool {
        matches!(self, Verb::Read | Verb::ReadMany)
    }
}

impl std::fmt::Display for Verb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Verb::Read => "read",
            Verb::ReadMany => "read-many",
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Replace => "replace",
            Verb::Delete => "delete",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceId(NodeIndex);

/// Which completed verbs refresh which kind of read.
#[derive(Debug, Clone, Default)]
pub struct Policy {
    pub read: Vec<Verb>,
    pub read_many: Vec<Verb>,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Single-item reads rerun after these verbs touch their item.
    pub fn read(mut self, verbs: impl IntoIterator<Item = Verb>) -> Self {
        self.read.extend(verbs);
        self
    }

    /// Read-many tasks rerun after these verbs complete in a compatible scope.
    pub fn read_many(mut self, verbs: impl IntoIterator<Item = Verb>) -> Self {
        self.read_many.extend(verbs);
        self
    }

    fn refreshes(&self, target: Verb, verb: Verb) -> bool {
        match target {
            Verb::Read => self.read.contains(&verb),
            Verb::ReadMany => self.read_many.contains(&verb),
            _ => false,
        }
    }
}

/// Declaration of a resource, passed to [`ResourceEngine::register`].
pub struct Registration {
    name: Cow<'static, str>,
    store: Arc<dyn Store>,
    policy: Policy,
    scope: Option<ParamScope>,
    mutable_key: Option<Arc<str>>,
    depends_on: Vec<ResourceId>,
}

impl Registration {
    pub fn new(name: impl Into<Cow<'static, str>>, store: Arc<dyn Store>) -> Self {
        Self {
            name: name.into(),
            store,
            policy: Policy::default(),
            scope: None,
            mutable_key: None,
            depends_on: Vec::new(),
        }
    }

    pub fn policy(mut self, policy: Policy) -> Self {
        self.policy = policy;
        self
    }

    /// Scope shared by every task of the resource, instead of the scope
    /// derived from each task's params.
    pub fn scope(mut self, scope: ParamScope) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Field holding an externally visible key that writes may change.
    pub fn mutable_key(mut self, field: impl Into<Arc<str>>) -> Self {
        self.mutable_key = Some(field.into());
        self
    }

    /// Read-many tasks of this resource rerun whenever `other` is written.
    pub fn depends_on(mut self, other: ResourceId) -> Self {
        self.depends_on.push(other);
        self
    }
}

struct Resource {
    name: Arc<str>,
    store: Arc<dyn Store>,
    policy: Policy,
    scope: Option<ParamScope>,
    mutable_key: Option<Arc<str>>,
    roots: Vec<(Verb, Task)>,
}

#[derive(Default)]
struct Registry {
    /// Edge `a -> b` means `b` depends on `a`.
    graph: Graph<Resource, ()>,
    roots: HashMap<TaskId, (ResourceId, Verb)>,
}

impl Registry {
    fn resource(&self, id: ResourceId) -> Result<&Resource, InvalidationError> {
        self.graph
            .node_weight(id.0)
            .ok_or_else(|| InvalidationError::UnknownResource(format!("{:?}", id.0)))
    }

    /// The resource and verb of `task`, found through its registered root.
    fn locate(&self, task: &Task) -> Option<(ResourceId, Verb)> {
        let mut current = Some(task.clone());
        while let Some(task) = current {
            if let Some(found) = self.roots.get(&task.id()) {
                return Some(*found);
            }
            current = task.parent();
        }
        None
    }
}

/// Reruns and resets planned after a write.
#[derive(Debug, Default)]
pub struct Invalidation {
    pub rerun: Vec<Task>,
    pub reset: Vec<Task>,
    pub reason: String,
}

impl Invalidation {
    pub fn is_empty(&self) -> bool {
        self.rerun.is_empty() && self.reset.is_empty()
    }

    pub fn into_dispatch(self) -> Dispatch {
        let dispatch = self
            .rerun
            .iter()
            .fold(Dispatch::new(), |dispatch, task| dispatch.rerun(task));
        self.reset
            .iter()
            .fold(dispatch, |dispatch, task| dispatch.reset(task))
            .reason(self.reason)
    }

    fn push_rerun(&mut self, task: &Task) {
        if !self.rerun.contains(task) {
            self.rerun.push(task.clone());
        }
    }

    fn push_reset(&mut self, task: &Task) {
        if !self.reset.contains(task) {
            self.reset.push(task.clone());
        }
    }
}

struct EngineInner {
    runtime: Runtime,
    registry: Mutex<Registry>,
}

/// Keeps registered resources and reacts to completed writes.
#[derive(Clone)]
pub struct ResourceEngine(Arc<EngineInner>);

impl ResourceEngine {
    pub fn new(runtime: Runtime) -> Self {
        Self(Arc::new(EngineInner {
            runtime,
            registry: Mutex::default(),
        }))
    }

    pub fn runtime(&self) -> &Runtime {
        &self.0.runtime
    }

    pub fn register(&self, registration: Registration) -> Result<ResourceId, InvalidationError> {
        let mut registry = self.0.registry.lock().unwrap();
        for dependency in &registration.depends_on {
            registry.resource(*dependency)?;
        }

        let index = registry.graph.add_node(Resource {
            name: registration.name.as_ref().into(),
            store: registration.store,
            policy: registration.policy,
            scope: registration.scope,
            mutable_key: registration.mutable_key,
            roots: Vec::new(),
        });

        for dependency in registration.depends_on {
            registry.graph.add_edge(dependency.0, index, ());
        }

        tracing::debug!("registered resource '{}'", registration.name);
        Ok(ResourceId(index))
    }

    /// Registers `task` and every child bound from it as a `verb` task of
    /// `resource`.
    pub fn register_task(&self, resource: ResourceId, verb: Verb, task: &Task) -> Result<(), InvalidationError> {
        let mut registry = self.0.registry.lock().unwrap();
        registry.resource(resource)?;
        registry.roots.insert(task.id(), (resource, verb));
        registry.graph[resource.0].roots.push((verb, task.clone()));
        Ok(())
    }

    pub fn store(&self, resource: ResourceId) -> Result<Arc<dyn Store>, InvalidationError> {
        let registry = self.0.registry.lock().unwrap();
        Ok(registry.resource(resource)?.store.clone())
    }

    /// Schedules the invalidation caused by `task` as a new dispatch.
    pub fn on_task_completed(&self, task: &Task) {
        let plan = self.plan(task);
        if plan.is_empty() {
            return;
        }

        tracing::info!(
            rerun = plan.rerun.len(),
            reset = plan.reset.len(),
            "invalidating after {}",
            plan.reason
        );

        let runtime = self.0.runtime.clone();
        tokio::spawn(async move {
            let dispatched = runtime.dispatch(plan.into_dispatch());
            if let Err(error) = dispatched.requested.await {
                tracing::warn!("refresh failed: {error}");
            }
        });
    }

    /// Computes what a completed `trigger` invalidates without dispatching.
    pub fn plan(&self, trigger: &Task) -> Invalidation {
        let registry = self.0.registry.lock().unwrap();

        let Some((resource, verb)) = registry.locate(trigger) else {
            return Invalidation::default();
        };
        if verb.is_read() || trigger.state() != State::Completed {
            return Invalidation::default();
        }

        let source = &registry.graph[resource.0];
        let data = trigger.data().unwrap_or_default();
        let scope = self.effective_scope(source, trigger);

        let written: Vec<Value> = verbs::items(&data);
        let deleted = match verb {
            Verb::Delete => verbs::identifiers(&*source.store, &data).unwrap_or_default(),
            _ => Vec::new(),
        };

        let mut plan = Invalidation {
            reason: format!("{verb} on '{}' by {}", source.name, trigger.name()),
            ..Default::default()
        };

        for (target, task) in descendants(&source.roots) {
            if !is_candidate(&task, trigger) {
                continue;
            }

            match target {
                Verb::ReadMany => {
                    if source.policy.refreshes(target, verb)
                        && compatible(scope.as_ref(), self.effective_scope(source, &task).as_ref())
                    {
                        plan.push_rerun(&task);
                    }
                }
                Verb::Read => {
                    let id = verbs::target(&*source.store, task.params());
                    if verb == Verb::Delete {
                        if id.is_some_and(|id| deleted.contains(&id)) {
                            plan.push_reset(&task);
                        }
                        continue;
                    }

                    let touched = id.is_some_and(|id| {
                        written
                            .iter()
                            .any(|item| source.store.identify(item).as_ref() == Some(&id))
                    });
                    if touched && source.policy.refreshes(target, verb) {
                        plan.push_rerun(&task);
                    } else if let Some(key) = &source.mutable_key
                        && written.iter().any(|item| matches_key(key, item, task.params()))
                    {
                        plan.push_rerun(&task);
                    }
                }
                _ => {}
            }
        }

        let dependents = registry
            .graph
            .neighbors_directed(resource.0, petgraph::Direction::Outgoing);
        for index in dependents {
            for (target, task) in descendants(&registry.graph[index].roots) {
                if target == Verb::ReadMany && is_candidate(&task, trigger) {
                    plan.push_rerun(&task);
                }
            }
        }

        plan
    }

    fn effective_scope(&self, resource: &Resource, task: &Task) -> Option<ParamScope> {
        if let Some(scope) = &resource.scope {
            return Some(scope.clone());
        }
        match task.params().as_record() {
            Some(record) if !record.is_empty() => Some(self.0.runtime.scope(task.params())),
            _ => None,
        }
    }
}

/// Every registered root with its live children, depth first.
fn descendants(roots: &[(Verb, Task)]) -> Vec<(Verb, Task)> {
    let mut found = Vec::new();
    let mut stack: Vec<_> = roots.iter().rev().cloned().collect();

    while let Some((verb, task)) = stack.pop() {
        stack.extend(task.children().into_iter().map(|child| (verb, child)));
        found.push((verb, task));
    }
    found
}

fn is_candidate(task: &Task, trigger: &Task) -> bool {
    let snapshot = task.snapshot();
    task != trigger && snapshot.state == State::Completed && !snapshot.is_prerun
}

fn compatible(trigger: Option<&ParamScope>, candidate: Option<&ParamScope>) -> bool {
    match (trigger, candidate) {
        (None, _) | (_, None) => true,
        (Some(trigger), Some(candidate)) => trigger == candidate || candidate.is_subset_of(trigger),
    }
}

/// True if `item` carries a value under `key` that the read `params` query.
fn matches_key(key: &str, item: &Value, params: &Value) -> bool {
    let Some(value) = item.get(key).filter(|value| !value.is_null()) else {
        return false;
    };
    match params.as_record() {
        Some(_) => params.get(key) == Some(value),
        None => params == value,
    }
}
