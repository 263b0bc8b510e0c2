//! The worker contract and its closure adapter.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::WorkerError;
use crate::worker::context::WorkerContext;

/// A pluggable unit of work for one task type.
///
/// Implementations receive the task payload and a [`WorkerContext`]; they
/// report progress and poll cancellation only through that context and must
/// not hold on to engine internals.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute the task. `Ok` completes it with the returned value, `Err`
    /// fails it with the error's code and message.
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: WorkerContext,
    ) -> Result<serde_json::Value, WorkerError>;
}

/// Adapts an async closure into a [`Worker`].
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(serde_json::Value, WorkerContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<serde_json::Value, WorkerError>> + Send,
{
    async fn run(
        &self,
        payload: serde_json::Value,
        ctx: WorkerContext,
    ) -> Result<serde_json::Value, WorkerError> {
        (self.f)(payload, ctx).await
    }
}

/// Wrap an async closure as a shareable worker.
pub fn worker_fn<F, Fut>(f: F) -> Arc<dyn Worker>
where
    F: Fn(serde_json::Value, WorkerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, WorkerError>> + Send + 'static,
{
    Arc::new(FnWorker::new(f))
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::task::TaskId;

    fn test_ctx() -> WorkerContext {
        let (tx, _rx) = mpsc::unbounded_channel();
        WorkerContext::new(TaskId::new(), CancellationToken::new(), tx)
    }

    #[tokio::test]
    async fn closure_worker_returns_value() {
        let worker = worker_fn(|payload, _ctx| async move {
            Ok(json!({"echo": payload}))
        });
        let out = worker.run(json!(5), test_ctx()).await.unwrap();
        assert_eq!(out, json!({"echo": 5}));
    }

    #[tokio::test]
    async fn closure_worker_propagates_error() {
        let worker = worker_fn(|_payload, _ctx| async move {
            Err(WorkerError::coded("ValueError", "bad sku"))
        });
        let err = worker.run(json!(null), test_ctx()).await.unwrap_err();
        assert_eq!(err.code.as_deref(), Some("ValueError"));
        assert_eq!(err.to_string(), "bad sku");
    }
}
