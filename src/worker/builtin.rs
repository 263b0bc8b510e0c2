//! Built-in demo workers for echoing, batch processing and failure.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::error::WorkerError;
use crate::task::Progress;
use crate::worker::context::WorkerContext;
use crate::worker::registry::WorkerRegistry;
use crate::worker::worker::Worker;

/// Register every built-in worker under its default type name.
pub fn register_builtin_workers(registry: &mut WorkerRegistry) {
    registry.register(EchoWorker::TASK_TYPE, std::sync::Arc::new(EchoWorker));
    registry.register(BatchWorker::TASK_TYPE, std::sync::Arc::new(BatchWorker));
    registry.register(FailWorker::TASK_TYPE, std::sync::Arc::new(FailWorker));
}

/// Returns its payload unchanged.
pub struct EchoWorker;

impl EchoWorker {
    pub const TASK_TYPE: &'static str = "echo";
}

#[async_trait]
impl Worker for EchoWorker {
    async fn run(
        &self,
        payload: serde_json::Value,
        _ctx: WorkerContext,
    ) -> Result<serde_json::Value, WorkerError> {
        Ok(payload)
    }
}

#[derive(Debug, Deserialize)]
struct BatchParams {
    items: BatchItems,
    #[serde(default)]
    delay_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BatchItems {
    Count(u64),
    List(Vec<serde_json::Value>),
}

impl BatchItems {
    fn len(&self) -> u64 {
        match self {
            Self::Count(n) => *n,
            Self::List(items) => items.len() as u64,
        }
    }

    /// Label of the item at `index`. Counted items are named on demand.
    fn label(&self, index: u64) -> String {
        match self {
            Self::Count(_) => format!("item-{}", index + 1),
            Self::List(items) => match items.get(index as usize) {
                Some(serde_json::Value::String(s)) => s.clone(),
                Some(other) => other.to_string(),
                None => format!("item-{}", index + 1),
            },
        }
    }
}

/// Processes `items` one at a time with `delay_ms` between them.
///
/// Payload: `{"items": 10, "delay_ms": 50}` or `{"items": ["a", "b"]}`.
/// Reports progress after every item and stops at the next item boundary
/// once cancellation is requested.
pub struct BatchWorker;

impl BatchWorker {
    pub const TASK_TYPE: &'static str = "batch";
}

#[async_trait]
impl Worker for BatchWorker {
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: WorkerContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let params: BatchParams = serde_json::from_value(payload)?;
        let total = params.items.len();
        let delay = Duration::from_millis(params.delay_ms);

        ctx.report_progress(Progress::items(0, total).with_message("starting"));

        for index in 0..total {
            if ctx.is_cancelled() {
                tracing::debug!(task_id = %ctx.task_id(), done = index, "Batch stopped on cancellation");
                return Err(WorkerError::cancelled());
            }

            if !delay.is_zero()
                && ctx
                    .cancellation_token()
                    .run_until_cancelled(tokio::time::sleep(delay))
                    .await
                    .is_none()
            {
                return Err(WorkerError::cancelled());
            }

            let done = index + 1;
            ctx.report_progress(
                Progress::items(done, total)
                    .with_current_item(params.items.label(index))
                    .with_message(format!("processed {done}/{total}")),
            );
        }

        Ok(json!({ "processed": total }))
    }
}

/// Always fails with the payload's `message` (and optional `code`).
pub struct FailWorker;

impl FailWorker {
    pub const TASK_TYPE: &'static str = "fail";
}

#[async_trait]
impl Worker for FailWorker {
    async fn run(
        &self,
        payload: serde_json::Value,
        _ctx: WorkerContext,
    ) -> Result<serde_json::Value, WorkerError> {
        let message = payload
            .get("message")
            .and_then(|v| v.as_str())
            .unwrap_or("task failed on purpose");
        match payload.get("code").and_then(|v| v.as_str()) {
            Some(code) => Err(WorkerError::coded(code, message)),
            None => Err(WorkerError::new(message)),
        }
    }
}
