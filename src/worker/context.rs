//! Per-run context handed to a worker.

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::task::{Progress, TaskId};

/// The only channel between a running worker and the engine.
///
/// Progress reports are queued without blocking and written to the registry
/// by the scheduler in the order they were made. Cancellation is cooperative:
/// workers check [`is_cancelled`](Self::is_cancelled) between items or race
/// their work against [`cancelled`](Self::cancelled).
#[derive(Debug, Clone)]
pub struct WorkerContext {
    task_id: TaskId,
    token: CancellationToken,
    progress_tx: mpsc::UnboundedSender<Progress>,
}

impl WorkerContext {
    pub fn new(
        task_id: TaskId,
        token: CancellationToken,
        progress_tx: mpsc::UnboundedSender<Progress>,
    ) -> Self {
        Self {
            task_id,
            token,
            progress_tx,
        }
    }

    /// Id of the task being executed.
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Report a progress snapshot. Never blocks; reports made after the
    /// task has finished are dropped.
    pub fn report_progress(&self, progress: Progress) {
        if self.progress_tx.send(progress).is_err() {
            tracing::trace!(task_id = %self.task_id, "Progress reported after task finished");
        }
    }

    /// Report progress from item counts with a message.
    pub fn report(&self, percent: u8, items_done: u64, items_total: u64, message: impl Into<String>) {
        self.report_progress(
            Progress::percent(percent)
                .with_items(items_done, items_total)
                .with_message(message),
        );
    }

    /// Whether cancellation (explicit, timeout, or shutdown) was requested.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }

    /// The underlying token, for handing to nested operations.
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.token
    }
}
