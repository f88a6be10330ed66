use std::sync::Arc;

use thiserror::Error;

/// Why a run was aborted. The first recorded reason wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AbortReason(pub Arc<str>);

impl AbortReason {
    pub fn new(reason: impl Into<Arc<str>>) -> Self {
        Self(reason.into())
    }
}

/// Failure of a single task run. Aborts are not failures, see
/// [`Outcome::Aborted`](crate::Outcome::Aborted).
///
/// Cheap to clone, so one in-flight result can be handed to every caller
/// waiting on it.
#[derive(Debug, Error, Clone)]
pub enum TaskError {
    #[error("Task '{0}' failed:\n{1}")]
    Failed(Arc<str>, Arc<anyhow::Error>),

    #[error("Task '{0}' panicked: {1}")]
    Panicked(Arc<str>, String),
}

impl TaskError {
    /// The user error behind a failure, if there is one.
    pub fn source_error(&self) -> Option<&anyhow::Error> {
        match self {
            TaskError::Failed(_, error) => Some(error),
            _ => None,
        }
    }
}

/// Shape errors raised by resource tasks at their own failure boundary.
#[derive(Debug, Error)]
pub enum InvalidationError {
    #[error("Delete on resource '{0}' returned {1}, expected an identifier or identifier-bearing value")]
    MalformedDeletion(String, String),

    #[error("Resource '{0}' is not registered")]
    UnknownResource(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't parse configuration.\n{0}")]
    Json(#[from] serde_json::Error),
}
