//! Task registry: the single source of truth for task records.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tokio::sync::Mutex;

use crate::error::TaskError;
use crate::store::{InMemoryTaskStore, LibSqlTaskStore, TaskFilter, TaskStore};
use crate::task::model::{FailureKind, Task, TaskFailure, TaskId, TaskType, TaskUpdate};
use crate::task::state::TaskStatus;

/// Synchronized create/read/update/query over a [`TaskStore`].
///
/// Every mutation is a read-modify-write of one record performed under a
/// single async mutex, so two updates never interleave. Reads go straight to
/// the store and never wait on that mutex.
pub struct TaskRegistry {
    store: Arc<dyn TaskStore>,
    write_lock: Mutex<()>,
    next_sequence: AtomicU64,
}

impl TaskRegistry {
    /// Create a registry over `store`, continuing its sequence numbering.
    pub async fn new(store: Arc<dyn TaskStore>) -> Result<Self, TaskError> {
        let last = store.max_sequence().await?;
        Ok(Self {
            store,
            write_lock: Mutex::new(()),
            next_sequence: AtomicU64::new(last + 1),
        })
    }

    /// Open a registry over a libSQL file at `db_path`, or over a fresh
    /// in-memory store when no path is given.
    pub async fn open(db_path: Option<&Path>) -> crate::Result<Self> {
        let store: Arc<dyn TaskStore> = match db_path {
            Some(path) => Arc::new(LibSqlTaskStore::new_local(path).await?),
            None => Arc::new(InMemoryTaskStore::new()),
        };
        Ok(Self::new(store).await?)
    }

    /// Create a registry over a fresh in-memory store.
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryTaskStore::new()),
            write_lock: Mutex::new(()),
            next_sequence: AtomicU64::new(1),
        }
    }

    /// Store a new `pending` record and return it.
    pub async fn create(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
    ) -> Result<Task, TaskError> {
        self.create_with_timeout(task_type, payload, None).await
    }

    /// Like [`create`](Self::create), recording a per-task deadline so it
    /// survives a restart.
    pub async fn create_with_timeout(
        &self,
        task_type: TaskType,
        payload: serde_json::Value,
        timeout: Option<std::time::Duration>,
    ) -> Result<Task, TaskError> {
        let _guard = self.write_lock.lock().await;
        let sequence = self.next_sequence.fetch_add(1, Ordering::SeqCst);
        let task = Task::new(sequence, task_type, payload).with_timeout(timeout);
        self.store.put(&task).await?;
        tracing::debug!(task_id = %task.id, task_type = %task.task_type, "Task record created");
        Ok(task)
    }

    /// Get a record by id.
    pub async fn get(&self, id: TaskId) -> Result<Task, TaskError> {
        self.store
            .get(id)
            .await?
            .ok_or(TaskError::NotFound { id })
    }

    /// Atomically apply `update` to a record and return the new state.
    ///
    /// Fails with `InvalidTransition` if the update implies a disallowed
    /// status edge; the stored record is then left untouched.
    pub async fn update(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        let _guard = self.write_lock.lock().await;
        let mut task = self
            .store
            .get(id)
            .await?
            .ok_or(TaskError::NotFound { id })?;
        task.apply(update)?;
        self.store.put(&task).await?;
        Ok(task)
    }

    /// Point-in-time snapshot of matching records, newest submission first.
    pub async fn list(&self, filter: &TaskFilter) -> Result<Vec<Task>, TaskError> {
        Ok(self.store.query(filter).await?)
    }

    /// Count records per status.
    pub async fn summary(&self) -> Result<StatusCounts, TaskError> {
        let tasks = self.store.query(&TaskFilter::new()).await?;

        let mut counts = StatusCounts::default();
        for task in &tasks {
            match task.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Running => counts.running += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
                TaskStatus::Cancelled => counts.cancelled += 1,
            }
        }
        counts.total = tasks.len();
        Ok(counts)
    }

    /// Evict terminal records according to `policy`. Active records are never
    /// evicted. Returns the number of records removed.
    pub async fn prune(&self, policy: &RetentionPolicy) -> Result<usize, TaskError> {
        let mut terminal = Vec::new();
        for status in TaskStatus::ALL.into_iter().filter(|s| s.is_terminal()) {
            terminal.extend(self.store.query(&TaskFilter::new().with_status(status)).await?);
        }
        terminal.sort_by(|a, b| b.sequence.cmp(&a.sequence));

        let cutoff = policy
            .max_age
            .and_then(|age| chrono::Duration::from_std(age).ok())
            .map(|age| chrono::Utc::now() - age);

        let victims: Vec<TaskId> = terminal
            .iter()
            .enumerate()
            .filter(|(index, task)| {
                let too_many = policy.max_terminal.is_some_and(|max| *index >= max);
                let too_old = match (cutoff, task.completed_at) {
                    (Some(cutoff), Some(done)) => done < cutoff,
                    _ => false,
                };
                too_many || too_old
            })
            .map(|(_, task)| task.id)
            .collect();

        if victims.is_empty() {
            return Ok(0);
        }

        let removed = self.store.remove(&victims).await?;
        tracing::info!(count = removed, "Pruned terminal tasks");
        Ok(removed)
    }

    /// Reconcile records left behind by a previous process.
    ///
    /// Records still `running` are failed with kind `interrupted`. Records
    /// still `pending` are returned oldest first so they can be re-queued.
    pub async fn recover(&self) -> Result<RecoveryReport, TaskError> {
        let _guard = self.write_lock.lock().await;

        let running = self
            .store
            .query(&TaskFilter::new().with_status(TaskStatus::Running))
            .await?;
        for mut task in running.iter().cloned() {
            task.apply(TaskUpdate::Fail(TaskFailure::new(
                FailureKind::Interrupted,
                "Task was running when the engine stopped",
            )))?;
            self.store.put(&task).await?;
            tracing::warn!(task_id = %task.id, task_type = %task.task_type, "Marked interrupted task as failed");
        }

        let mut pending = self
            .store
            .query(&TaskFilter::new().with_status(TaskStatus::Pending))
            .await?;
        pending.reverse();

        Ok(RecoveryReport {
            interrupted: running.len(),
            pending,
        })
    }
}

/// Count of records per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// What [`TaskRegistry::recover`] found.
#[derive(Debug, Default)]
pub struct RecoveryReport {
    /// Records moved from `running` to `failed`.
    pub interrupted: usize,
    /// Records still `pending`, oldest submission first.
    pub pending: Vec<Task>,
}

/// Eviction policy for terminal records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Evict terminal records that finished longer ago than this.
    pub max_age: Option<std::time::Duration>,
    /// Keep at most this many terminal records (newest kept).
    pub max_terminal: Option<usize>,
}

/// Spawn a background task that periodically prunes the registry.
pub fn spawn_retention_task(
    registry: Arc<TaskRegistry>,
    policy: RetentionPolicy,
    interval: std::time::Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip immediate first tick
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if let Err(e) = registry.prune(&policy).await {
                tracing::error!("Retention sweep failed: {}", e);
            }
        }
    })
}
