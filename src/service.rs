//! Query facade: the caller-facing surface of the engine.
//!
//! Every operation has a serde request/response shape so any transport can
//! sit in front of [`TaskService::dispatch`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;
use crate::store::TaskFilter;
use crate::task::{Progress, StatusCounts, Task, TaskFailure, TaskId, TaskStatus, TaskType};
use crate::worker::{CancelOutcome, SubmitOptions, TaskManager};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Per-task deadline in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: TaskId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<TaskFailure>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultResponse {
    pub task_id: TaskId,
    pub result: serde_json::Value,
}

/// One row of a listing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSummary {
    pub task_id: TaskId,
    pub task_type: TaskType,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl From<&Task> for TaskSummary {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            task_type: task.task_type.clone(),
            status: task.status,
            percent: task.progress.as_ref().map(|p| p.percent),
            created_at: task.created_at,
            completed_at: task.completed_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListResponse {
    pub tasks: Vec<TaskSummary>,
}

/// Outcome of a cancel request.
///
/// `status` is `cancelled` for a task that had not started, `already_terminal`
/// for a finished one, and `cancel_requested` for a running task. In the last
/// case the record turns `cancelled` only once its worker returns, so callers
/// should poll `status` until it is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelResponse {
    pub task_id: TaskId,
    pub status: CancelOutcome,
}

/// A facade operation, tagged by `op`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Submit(SubmitRequest),
    Status { task_id: TaskId },
    Result { task_id: TaskId },
    List(TaskFilter),
    Cancel { task_id: TaskId },
    Summary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Response {
    Submit(SubmitResponse),
    Status(StatusResponse),
    Result(ResultResponse),
    List(ListResponse),
    Cancel(CancelResponse),
    Summary(StatusCounts),
}

/// Submit, inspect, list and cancel tasks.
#[derive(Clone)]
pub struct TaskService {
    manager: TaskManager,
}

impl TaskService {
    pub fn new(manager: TaskManager) -> Self {
        Self { manager }
    }

    pub fn manager(&self) -> &TaskManager {
        &self.manager
    }

    /// Route a request to the matching operation.
    pub async fn dispatch(&self, request: Request) -> Result<Response, TaskError> {
        Ok(match request {
            Request::Submit(req) => Response::Submit(self.submit(req).await?),
            Request::Status { task_id } => Response::Status(self.status(task_id).await?),
            Request::Result { task_id } => Response::Result(self.result(task_id).await?),
            Request::List(filter) => Response::List(self.list(filter).await?),
            Request::Cancel { task_id } => Response::Cancel(self.cancel(task_id).await?),
            Request::Summary => Response::Summary(self.summary().await?),
        })
    }

    pub async fn submit(&self, request: SubmitRequest) -> Result<SubmitResponse, TaskError> {
        let options = SubmitOptions {
            timeout: request.timeout_secs.map(std::time::Duration::from_secs),
        };
        let task_id = self
            .manager
            .submit_with(request.task_type, request.payload, options)
            .await?;
        Ok(SubmitResponse { task_id })
    }

    pub async fn status(&self, task_id: TaskId) -> Result<StatusResponse, TaskError> {
        let task = self.manager.registry().get(task_id).await?;
        Ok(StatusResponse {
            task_id,
            task_type: task.task_type,
            status: task.status,
            progress: task.progress,
            error: task.error,
        })
    }

    /// The result of a completed task; `InvalidState` carrying the current
    /// status otherwise.
    pub async fn result(&self, task_id: TaskId) -> Result<ResultResponse, TaskError> {
        let task = self.manager.registry().get(task_id).await?;
        match (task.status, task.result) {
            (TaskStatus::Completed, Some(result)) => Ok(ResultResponse { task_id, result }),
            (status, _) => Err(TaskError::InvalidState {
                id: task_id,
                status,
            }),
        }
    }

    pub async fn list(&self, filter: TaskFilter) -> Result<ListResponse, TaskError> {
        let tasks = self.manager.registry().list(&filter).await?;
        Ok(ListResponse {
            tasks: tasks.iter().map(TaskSummary::from).collect(),
        })
    }

    pub async fn cancel(&self, task_id: TaskId) -> Result<CancelResponse, TaskError> {
        let status = self.manager.cancel(task_id).await?;
        Ok(CancelResponse { task_id, status })
    }

    pub async fn summary(&self) -> Result<StatusCounts, TaskError> {
        self.manager.registry().summary().await
    }
}
