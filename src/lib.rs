#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cache;
mod core;
pub mod dispatch;
mod error;
#[cfg(feature = "logging")]
pub mod logging;
mod prerun;
pub mod resource;
mod runtime;
pub mod task;
mod value;

pub use crate::cache::{Ephemeral, EphemeronCache};
pub use crate::core::{Config, Hash32, ParamScope};
pub use crate::dispatch::{Dispatch, Dispatched, Method};
pub use crate::error::*;
pub use crate::prerun::PrerunRegistry;
pub use crate::resource::{
    Invalidation, MemoryStore, Policy, Registration, ResourceEngine, ResourceId, Store, Verb,
};
pub use crate::runtime::Runtime;
pub use crate::task::{
    Action, Outcome, ReactiveTask, RunOptions, RunResult, Snapshot, State, Task, TaskContext,
    TaskDef, TaskId,
};
pub use crate::value::{Identity, Record, Value, equal};
