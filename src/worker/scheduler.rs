//! Task manager: admission, execution, cancellation and timeouts.
//!
//! Submitted tasks wait in a FIFO queue until one of `max_concurrent` slots
//! frees. Each admitted task runs on its own tokio task under a child of the
//! manager's root cancellation token, so a single `shutdown` reaches every
//! running worker. Terminal statuses are written with the admission lock held,
//! which keeps `cancel` and task completion from racing each other.

use std::collections::{HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, broadcast, mpsc};
use tokio::time::Instant;
use tokio_stream::Stream;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::ManagerConfig;
use crate::error::{TaskError, WorkerError};
use crate::task::{
    FailureKind, Progress, Task, TaskFailure, TaskId, TaskRegistry, TaskStatus, TaskType,
    TaskUpdate,
};
use crate::worker::context::WorkerContext;
use crate::worker::registry::WorkerRegistry;
use crate::worker::worker::Worker;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// Attempts at writing a task's terminal status before giving up.
const FINISH_ATTEMPTS: u32 = 5;

/// Base delay between terminal write attempts; grows linearly.
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(20);

/// Lifecycle notifications broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TaskEvent {
    Submitted { task_id: TaskId, task_type: TaskType },
    Started { task_id: TaskId },
    Progress { task_id: TaskId, progress: Progress },
    Finished { task_id: TaskId, status: TaskStatus },
}

impl TaskEvent {
    pub fn task_id(&self) -> TaskId {
        match self {
            Self::Submitted { task_id, .. }
            | Self::Started { task_id }
            | Self::Progress { task_id, .. }
            | Self::Finished { task_id, .. } => *task_id,
        }
    }
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    /// The task was pending and is now `cancelled`; its worker never ran.
    Cancelled,
    /// The task is running; it becomes `cancelled` once its worker returns.
    CancelRequested,
    /// The task had already finished; nothing changed.
    AlreadyTerminal,
}

impl CancelOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cancelled => "cancelled",
            Self::CancelRequested => "cancel_requested",
            Self::AlreadyTerminal => "already_terminal",
        }
    }
}

impl std::fmt::Display for CancelOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-submission overrides.
#[derive(Debug, Clone, Default)]
pub struct SubmitOptions {
    /// Deadline for this task, replacing the manager default. Stored on the
    /// record, so it still applies when the task is re-queued after a restart.
    pub timeout: Option<Duration>,
}

impl SubmitOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

struct Admission {
    pending: VecDeque<TaskId>,
    running: HashMap<TaskId, CancellationToken>,
    accepting: bool,
}

struct Inner {
    registry: Arc<TaskRegistry>,
    workers: WorkerRegistry,
    config: ManagerConfig,
    queue: Mutex<Admission>,
    events: broadcast::Sender<TaskEvent>,
    /// Parent of every task token; cancelled on shutdown.
    root: CancellationToken,
    /// Cancelled when shutdown gives up waiting on workers.
    abandon: CancellationToken,
    tracker: TaskTracker,
}

enum RunOutcome {
    Returned(Result<serde_json::Value, WorkerError>),
    Panicked(String),
    TimedOut(Duration),
    Abandoned,
}

/// Builder for [`TaskManager`]. The worker table is frozen by [`start`](Self::start).
pub struct TaskManagerBuilder {
    registry: Arc<TaskRegistry>,
    workers: WorkerRegistry,
    config: ManagerConfig,
}

impl TaskManagerBuilder {
    /// Register a worker for a task type.
    pub fn worker(mut self, task_type: impl Into<TaskType>, worker: Arc<dyn Worker>) -> Self {
        self.workers.register(task_type, worker);
        self
    }

    /// Add every worker from an existing table.
    pub fn workers(mut self, workers: WorkerRegistry) -> Self {
        for task_type in workers.types() {
            if let Some(worker) = workers.get(&task_type) {
                self.workers.register(task_type, worker);
            }
        }
        self
    }

    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Recover leftover records, re-queue surviving pending tasks in
    /// submission order and start admitting.
    pub async fn start(self) -> Result<TaskManager, TaskError> {
        let report = self.registry.recover().await?;

        let (events, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        let inner = Arc::new(Inner {
            registry: self.registry,
            workers: self.workers,
            config: self.config,
            queue: Mutex::new(Admission {
                pending: VecDeque::new(),
                running: HashMap::new(),
                accepting: true,
            }),
            events,
            root: CancellationToken::new(),
            abandon: CancellationToken::new(),
            tracker: TaskTracker::new(),
        });

        {
            let mut queue = inner.queue.lock().await;
            let mut requeued = 0usize;
            for task in report.pending {
                if inner.workers.contains(&task.task_type) {
                    queue.pending.push_back(task.id);
                    requeued += 1;
                } else {
                    tracing::warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        "No worker for recovered task, cancelling"
                    );
                    inner.registry.update(task.id, TaskUpdate::Cancel).await?;
                }
            }
            if report.interrupted > 0 || requeued > 0 {
                tracing::info!(
                    interrupted = report.interrupted,
                    requeued,
                    "Recovered tasks from previous run"
                );
            }
            inner.admit(&mut queue).await;
        }

        tracing::info!(
            max_concurrent = inner.config.max_concurrent,
            workers = inner.workers.len(),
            "Task manager started"
        );
        Ok(TaskManager { inner })
    }
}

/// Runs submitted tasks with bounded concurrency.
///
/// Cheap to clone; all clones share one queue and one set of workers.
#[derive(Clone)]
pub struct TaskManager {
    inner: Arc<Inner>,
}

impl TaskManager {
    pub fn builder(registry: Arc<TaskRegistry>) -> TaskManagerBuilder {
        TaskManagerBuilder {
            registry,
            workers: WorkerRegistry::new(),
            config: ManagerConfig::default(),
        }
    }

    /// Submit a task and return its id without waiting for it to run.
    pub async fn submit(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
    ) -> Result<TaskId, TaskError> {
        self.submit_with(task_type, payload, SubmitOptions::default())
            .await
    }

    /// Submit a task with per-task options.
    pub async fn submit_with(
        &self,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        options: SubmitOptions,
    ) -> Result<TaskId, TaskError> {
        let task_type = task_type.into();
        if !self.inner.workers.contains(&task_type) {
            return Err(TaskError::UnknownTaskType {
                task_type: task_type.to_string(),
            });
        }

        let mut queue = self.inner.queue.lock().await;
        if !queue.accepting {
            return Err(TaskError::ShuttingDown);
        }
        if let Some(max) = self.inner.config.max_pending
            && queue.pending.len() >= max
        {
            return Err(TaskError::CapacityExceeded { max });
        }

        let task = self
            .inner
            .registry
            .create_with_timeout(task_type, payload, options.timeout)
            .await?;
        queue.pending.push_back(task.id);
        tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task submitted");
        let _ = self.inner.events.send(TaskEvent::Submitted {
            task_id: task.id,
            task_type: task.task_type,
        });

        self.inner.admit(&mut queue).await;
        Ok(task.id)
    }

    /// Cancel a task.
    ///
    /// Pending tasks are cancelled immediately. Running tasks have their
    /// token raised and are recorded `cancelled` once the worker returns.
    pub async fn cancel(&self, id: TaskId) -> Result<CancelOutcome, TaskError> {
        let mut queue = self.inner.queue.lock().await;

        if let Some(position) = queue.pending.iter().position(|queued| *queued == id) {
            queue.pending.remove(position);
            self.inner.registry.update(id, TaskUpdate::Cancel).await?;
            tracing::info!(task_id = %id, "Pending task cancelled");
            self.inner.emit_finished(id, TaskStatus::Cancelled);
            return Ok(CancelOutcome::Cancelled);
        }

        if let Some(token) = queue.running.get(&id) {
            token.cancel();
            tracing::info!(task_id = %id, "Cancellation requested for running task");
            return Ok(CancelOutcome::CancelRequested);
        }

        let task = self.inner.registry.get(id).await?;
        if task.status.is_terminal() {
            return Ok(CancelOutcome::AlreadyTerminal);
        }

        // Active record this manager is not tracking: no worker of ours can
        // still be running it.
        tracing::warn!(task_id = %id, status = %task.status, "Cancelling untracked task");
        self.inner.registry.update(id, TaskUpdate::Cancel).await?;
        self.inner.emit_finished(id, TaskStatus::Cancelled);
        Ok(CancelOutcome::Cancelled)
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<TaskEvent> {
        self.inner.events.subscribe()
    }

    /// Lifecycle events as a stream. Events missed by a slow consumer are skipped.
    pub fn events(&self) -> impl Stream<Item = TaskEvent> + Send + 'static {
        use tokio_stream::StreamExt;

        BroadcastStream::new(self.subscribe()).filter_map(|event| match event {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!("Event subscriber lagged: {}", e);
                None
            }
        })
    }

    pub async fn running_count(&self) -> usize {
        self.inner.queue.lock().await.running.len()
    }

    pub async fn pending_count(&self) -> usize {
        self.inner.queue.lock().await.pending.len()
    }

    pub fn registry(&self) -> &Arc<TaskRegistry> {
        &self.inner.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Task types with a registered worker.
    pub fn task_types(&self) -> Vec<TaskType> {
        self.inner.workers.types()
    }

    /// Stop admitting, cancel every pending task and ask running workers to
    /// stop. Workers still running after `shutdown_grace` are abandoned and
    /// recorded as failed. Calling it again only waits for the first call.
    pub async fn shutdown(&self) {
        {
            let mut queue = self.inner.queue.lock().await;
            if queue.accepting {
                queue.accepting = false;
                let drained: Vec<TaskId> = queue.pending.drain(..).collect();
                for id in drained {
                    match self.inner.registry.update(id, TaskUpdate::Cancel).await {
                        Ok(_) => self.inner.emit_finished(id, TaskStatus::Cancelled),
                        Err(e) => tracing::error!(task_id = %id, "Failed to cancel pending task on shutdown: {}", e),
                    }
                }
                tracing::info!(running = queue.running.len(), "Task manager shutting down");
                self.inner.root.cancel();
            }
        }

        self.inner.tracker.close();
        if tokio::time::timeout(self.inner.config.shutdown_grace, self.inner.tracker.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                grace = ?self.inner.config.shutdown_grace,
                "Workers did not stop in time, abandoning them"
            );
            self.inner.abandon.cancel();
            self.inner.tracker.wait().await;
        }
        tracing::info!("Task manager stopped");
    }
}

impl Inner {
    /// Admit pending tasks while slots are free. Called with the admission lock held.
    async fn admit(self: &Arc<Self>, queue: &mut Admission) {
        while queue.accepting && queue.running.len() < self.config.max_concurrent {
            let Some(next) = queue.pending.pop_front() else {
                break;
            };

            let task = match self.registry.update(next, TaskUpdate::Start).await {
                Ok(task) => task,
                Err(e) => {
                    tracing::warn!(task_id = %next, "Skipping task that could not start: {}", e);
                    continue;
                }
            };

            let Some(worker) = self.workers.get(&task.task_type) else {
                tracing::error!(task_id = %task.id, task_type = %task.task_type, "No worker registered");
                let failure = TaskFailure::new(
                    FailureKind::WorkerError,
                    format!("No worker registered for task type '{}'", task.task_type),
                );
                if let Err(e) = self.registry.update(task.id, TaskUpdate::Fail(failure)).await {
                    tracing::error!(task_id = %task.id, "Failed to record failure: {}", e);
                }
                self.emit_finished(task.id, TaskStatus::Failed);
                continue;
            };

            let token = self.root.child_token();
            queue.running.insert(task.id, token.clone());
            tracing::info!(task_id = %task.id, task_type = %task.task_type, "Task started");
            let _ = self.events.send(TaskEvent::Started { task_id: task.id });

            let timeout = task.timeout().or(self.config.task_timeout);
            self.spawn_run(task, worker, token, timeout);
        }
    }

    fn spawn_run(
        self: &Arc<Self>,
        task: Task,
        worker: Arc<dyn Worker>,
        token: CancellationToken,
        timeout: Option<Duration>,
    ) {
        let inner = Arc::clone(self);
        self.tracker
            .spawn(async move { inner.run_task(task, worker, token, timeout).await });
    }

    async fn run_task(
        self: Arc<Self>,
        task: Task,
        worker: Arc<dyn Worker>,
        token: CancellationToken,
        timeout: Option<Duration>,
    ) {
        let started = Instant::now();
        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let ctx = WorkerContext::new(task.id, token.clone(), progress_tx);

        let outcome = {
            let run = AssertUnwindSafe(worker.run(task.payload.clone(), ctx)).catch_unwind();
            tokio::pin!(run);

            // Far-future placeholder; the branch is disabled without a deadline.
            let deadline = timeout.map(|t| started + t);
            let timer = tokio::time::sleep_until(
                deadline.unwrap_or_else(|| started + Duration::from_secs(86_400 * 365)),
            );
            tokio::pin!(timer);
            let mut grace_started = false;

            loop {
                tokio::select! {
                    biased;

                    Some(progress) = progress_rx.recv() => {
                        self.record_progress(task.id, progress).await;
                    }
                    result = &mut run => {
                        break match result {
                            Ok(returned) => RunOutcome::Returned(returned),
                            Err(panic) => RunOutcome::Panicked(panic_message(panic.as_ref())),
                        };
                    }
                    () = &mut timer, if deadline.is_some() => {
                        if grace_started {
                            break RunOutcome::TimedOut(timeout.unwrap_or_default());
                        }
                        grace_started = true;
                        tracing::warn!(
                            task_id = %task.id,
                            timeout = ?timeout,
                            "Task exceeded its deadline, requesting cancellation"
                        );
                        token.cancel();
                        timer.as_mut().reset(Instant::now() + self.config.timeout_grace);
                    }
                    () = self.abandon.cancelled() => break RunOutcome::Abandoned,
                }
            }
        };

        while let Ok(progress) = progress_rx.try_recv() {
            self.record_progress(task.id, progress).await;
        }

        let mut queue = self.queue.lock().await;
        let update = match outcome {
            RunOutcome::Returned(_) if token.is_cancelled() => TaskUpdate::Cancel,
            RunOutcome::Returned(Ok(value)) => TaskUpdate::Complete(value),
            RunOutcome::Returned(Err(e)) => {
                let failure = TaskFailure::new(FailureKind::WorkerError, e.message);
                TaskUpdate::Fail(match e.code {
                    Some(code) => failure.with_code(code),
                    None => failure,
                })
            }
            RunOutcome::Panicked(message) => TaskUpdate::Fail(TaskFailure::new(
                FailureKind::Panic,
                format!("Worker panicked: {message}"),
            )),
            RunOutcome::TimedOut(limit) => TaskUpdate::Fail(TaskFailure::new(
                FailureKind::Timeout,
                format!(
                    "Task exceeded its {limit:?} deadline and did not stop within {:?}",
                    self.config.timeout_grace
                ),
            )),
            RunOutcome::Abandoned => TaskUpdate::Fail(TaskFailure::new(
                FailureKind::Interrupted,
                "Worker did not stop before shutdown completed",
            )),
        };

        match self.finish(task.id, update).await {
            Ok(finished) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &finished.error {
                    Some(error) => tracing::warn!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        kind = %error.kind,
                        elapsed_ms,
                        "Task failed: {}",
                        error.message
                    ),
                    None => tracing::info!(
                        task_id = %task.id,
                        task_type = %task.task_type,
                        status = %finished.status,
                        elapsed_ms,
                        "Task finished"
                    ),
                }
                self.emit_finished(task.id, finished.status);
            }
            Err(TaskError::Store(e)) => {
                // The record still says running, so the slot stays taken.
                tracing::error!(task_id = %task.id, "Task outcome could not be recorded, holding its slot: {}", e);
                return;
            }
            Err(e) => {
                tracing::error!(task_id = %task.id, "Failed to record task outcome: {}", e);
            }
        }

        queue.running.remove(&task.id);
        self.admit(&mut queue).await;
    }

    /// Write a terminal update, retrying while the store is failing. After
    /// the last attempt the task is recorded `failed`/`interrupted` instead.
    async fn finish(&self, id: TaskId, update: TaskUpdate) -> Result<Task, TaskError> {
        let mut attempt = 1;
        let last_error = loop {
            match self.registry.update(id, update.clone()).await {
                Err(TaskError::Store(e)) => {
                    if attempt >= FINISH_ATTEMPTS {
                        break e;
                    }
                    tracing::warn!(task_id = %id, attempt, "Failed to record task outcome, retrying: {}", e);
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                other => return other,
            }
        };

        let failure = TaskFailure::new(
            FailureKind::Interrupted,
            format!("Task outcome could not be recorded: {last_error}"),
        );
        self.registry.update(id, TaskUpdate::Fail(failure)).await
    }

    async fn record_progress(&self, id: TaskId, progress: Progress) {
        match self.registry.update(id, TaskUpdate::Progress(progress)).await {
            Ok(task) => {
                if let Some(progress) = task.progress {
                    tracing::debug!(task_id = %id, percent = progress.percent, "Task progress");
                    let _ = self.events.send(TaskEvent::Progress {
                        task_id: id,
                        progress,
                    });
                }
            }
            Err(e) => tracing::debug!(task_id = %id, "Dropped progress report: {}", e),
        }
    }

    fn emit_finished(&self, task_id: TaskId, status: TaskStatus) {
        let _ = self.events.send(TaskEvent::Finished { task_id, status });
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
