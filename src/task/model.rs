//! Task record types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::TaskError;
use crate::task::state::TaskStatus;

/// Unique identifier of a task, assigned at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Generate a new random id.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Opaque tag selecting the worker that executes a task.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for TaskType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// In-flight completion snapshot of a running task.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    /// Completion percentage, 0 to 100.
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_item: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_done: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Progress {
    /// Progress at a given percentage (clamped to 100).
    pub fn percent(percent: u8) -> Self {
        Self {
            percent: percent.min(100),
            ..Default::default()
        }
    }

    /// Progress derived from an item count. An empty batch counts as done.
    pub fn items(done: u64, total: u64) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (u128::from(done.min(total)) * 100 / u128::from(total)) as u8
        };
        Self {
            percent,
            items_done: Some(done),
            items_total: Some(total),
            ..Default::default()
        }
    }

    pub fn with_items(mut self, done: u64, total: u64) -> Self {
        self.items_done = Some(done);
        self.items_total = Some(total);
        self
    }

    pub fn with_current_item(mut self, item: impl Into<String>) -> Self {
        self.current_item = Some(item.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Category of a recorded task failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The worker returned an error.
    WorkerError,
    /// The task deadline elapsed and the worker did not yield within the grace period.
    Timeout,
    /// The worker panicked.
    Panic,
    /// The task was running when the previous process exited.
    Interrupted,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WorkerError => "worker_error",
            Self::Timeout => "timeout",
            Self::Panic => "panic",
            Self::Interrupted => "interrupted",
        }
    }
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error attached to a failed task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub kind: FailureKind,
    /// Worker-supplied error kind (for example `"ValueError"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Human-readable description; never empty.
    pub message: String,
}

impl TaskFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind,
            code: None,
            message: if message.is_empty() {
                kind.to_string()
            } else {
                message
            },
        }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

/// A mutation the registry applies atomically to one record.
#[derive(Debug, Clone)]
pub enum TaskUpdate {
    /// `pending -> running`.
    Start,
    /// Progress report while running.
    Progress(Progress),
    /// `running -> completed` with the worker's result.
    Complete(serde_json::Value),
    /// `running -> failed`.
    Fail(TaskFailure),
    /// `pending -> cancelled` or `running -> cancelled`.
    Cancel,
}

/// The authoritative record of one unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    /// Submission order within a registry; larger is newer.
    pub sequence: u64,
    pub task_type: TaskType,
    pub status: TaskStatus,
    pub payload: serde_json::Value,
    pub progress: Option<Progress>,
    pub result: Option<serde_json::Value>,
    pub error: Option<TaskFailure>,
    /// Per-task deadline in milliseconds, overriding the manager default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new pending task.
    pub fn new(sequence: u64, task_type: TaskType, payload: serde_json::Value) -> Self {
        Self {
            id: TaskId::new(),
            sequence,
            task_type,
            status: TaskStatus::Pending,
            payload,
            progress: None,
            result: None,
            error: None,
            timeout_ms: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Attach a per-task deadline.
    pub fn with_timeout(mut self, timeout: Option<std::time::Duration>) -> Self {
        self.timeout_ms = timeout.map(|t| t.as_millis().min(u128::from(u64::MAX)) as u64);
        self
    }

    /// The per-task deadline, if one was given at submission.
    pub fn timeout(&self) -> Option<std::time::Duration> {
        self.timeout_ms.map(std::time::Duration::from_millis)
    }

    /// Apply a mutation, enforcing the allowed status edges.
    pub fn apply(&mut self, update: TaskUpdate) -> Result<(), TaskError> {
        match update {
            TaskUpdate::Start => {
                self.transition_to(TaskStatus::Running)?;
                self.started_at = Some(Utc::now());
            }
            TaskUpdate::Progress(progress) => {
                if self.status != TaskStatus::Running {
                    return Err(TaskError::InvalidState {
                        id: self.id,
                        status: self.status,
                    });
                }
                self.merge_progress(progress);
            }
            TaskUpdate::Complete(result) => {
                self.transition_to(TaskStatus::Completed)?;
                self.result = Some(result);
                self.completed_at = Some(Utc::now());
            }
            TaskUpdate::Fail(failure) => {
                self.transition_to(TaskStatus::Failed)?;
                self.error = Some(failure);
                self.completed_at = Some(Utc::now());
            }
            TaskUpdate::Cancel => {
                self.transition_to(TaskStatus::Cancelled)?;
                self.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    fn transition_to(&mut self, target: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(target) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: target,
            });
        }
        self.status = target;
        Ok(())
    }

    // Percent never moves backwards while running.
    fn merge_progress(&mut self, mut progress: Progress) {
        progress.percent = progress.percent.min(100);
        if let Some(previous) = &self.progress
            && progress.percent < previous.percent
        {
            tracing::debug!(
                task_id = %self.id,
                reported = progress.percent,
                kept = previous.percent,
                "Ignoring progress regression"
            );
            progress.percent = previous.percent;
        }
        self.progress = Some(progress);
    }
}
