//! Task records and the registry that owns them.
//!
//! - `state`: status state machine (pending → running → completed/failed/cancelled)
//! - `model`: the task record, progress, failures and typed mutations
//! - `registry`: synchronized store front-end, retention and restart recovery

pub mod model;
pub mod registry;
pub mod state;

pub use model::{FailureKind, Progress, Task, TaskFailure, TaskId, TaskType, TaskUpdate};
pub use registry::{RecoveryReport, RetentionPolicy, StatusCounts, TaskRegistry, spawn_retention_task};
pub use state::TaskStatus;
