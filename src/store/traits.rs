//! `TaskStore` trait: the storage seam behind the task registry.
//!
//! The registry owns all domain logic (state machine, serialization of
//! writers); a store only keeps records. Implement this trait to back the
//! engine with durable storage.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::DatabaseError;
use crate::task::{Task, TaskId, TaskStatus, TaskType};

/// Selection criteria for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_type: Option<TaskType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, task_type: impl Into<TaskType>) -> Self {
        self.task_type = Some(task_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Check whether a record satisfies the status and type criteria.
    pub fn matches(&self, task: &Task) -> bool {
        self.status.is_none_or(|s| task.status == s)
            && self
                .task_type
                .as_ref()
                .is_none_or(|t| &task.task_type == t)
    }
}

/// Backend-agnostic storage for task records.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert or replace a record.
    async fn put(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Get a record by id.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError>;

    /// Records matching `filter`, newest submission (highest sequence) first,
    /// truncated to `filter.limit`.
    async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError>;

    /// Delete records. Returns how many existed.
    async fn remove(&self, ids: &[TaskId]) -> Result<usize, DatabaseError>;

    /// Highest sequence number stored, or 0 when empty.
    async fn max_sequence(&self) -> Result<u64, DatabaseError>;
}
