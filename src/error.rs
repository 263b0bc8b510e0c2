//! Error types for the task engine.

use crate::task::{TaskId, TaskStatus};

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle and query errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {id} is {status}, operation not valid in this state")]
    InvalidState { id: TaskId, status: TaskStatus },

    #[error("Task {id} cannot transition from {from} to {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("No worker registered for task type '{task_type}'")]
    UnknownTaskType { task_type: String },

    #[error("Pending queue is full ({max} tasks waiting)")]
    CapacityExceeded { max: usize },

    #[error("Task manager is shutting down")]
    ShuttingDown,

    #[error("Storage error: {0}")]
    Store(#[from] DatabaseError),
}

/// Error returned by a worker.
///
/// `code` is the worker's own error kind (for example `"ValueError"`) and
/// is recorded on the failed task alongside the message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct WorkerError {
    pub code: Option<String>,
    pub message: String,
}

impl WorkerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
        }
    }

    /// An error carrying a worker-defined kind.
    pub fn coded(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: Some(code.into()),
            message: message.into(),
        }
    }

    /// Returned by workers that stop early after observing cancellation.
    pub fn cancelled() -> Self {
        Self::coded("Cancelled", "worker stopped after cancellation was requested")
    }
}

impl From<anyhow::Error> for WorkerError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{e:#}"))
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(e: serde_json::Error) -> Self {
        Self::coded("InvalidPayload", e.to_string())
    }
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_message_names_status() {
        let id = TaskId::new();
        let err = TaskError::InvalidState {
            id,
            status: TaskStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("running"));
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn store_error_converts_into_task_error() {
        let err: TaskError = DatabaseError::Query("boom".into()).into();
        assert!(matches!(err, TaskError::Store(DatabaseError::Query(_))));
        let top: Error = err.into();
        assert!(top.to_string().starts_with("Task error"));
    }

    #[test]
    fn io_error_converts_into_config_error() {
        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only");
        let top: Error = ConfigError::from(io).into();
        assert!(matches!(top, Error::Config(ConfigError::Io(_))));
        assert!(top.to_string().contains("read-only"));
    }

    #[test]
    fn worker_error_from_anyhow_keeps_context() {
        let err = anyhow::anyhow!("bad sku").context("pricing lookup");
        let worker: WorkerError = err.into();
        assert_eq!(worker.message, "pricing lookup: bad sku");
        assert!(worker.code.is_none());
    }

    #[test]
    fn worker_error_from_json_is_invalid_payload() {
        let err = serde_json::from_str::<u32>("\"x\"").unwrap_err();
        let worker: WorkerError = err.into();
        assert_eq!(worker.code.as_deref(), Some("InvalidPayload"));
    }
}
