//! End-to-end tests for the task engine.
//!
//! Each test builds a registry, a manager with test workers and the service
//! facade, then drives them only through the public API.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tokio_stream::StreamExt;

use task_engine::config::ManagerConfig;
use task_engine::error::{TaskError, WorkerError};
use task_engine::service::{SubmitRequest, TaskService};
use task_engine::store::{LibSqlTaskStore, TaskFilter, TaskStore};
use task_engine::task::{
    FailureKind, Progress, RetentionPolicy, TaskId, TaskRegistry, TaskStatus, TaskUpdate,
    spawn_retention_task,
};
use task_engine::worker::{
    BatchWorker, CancelOutcome, TaskEvent, TaskManager, TaskManagerBuilder, Worker, worker_fn,
};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

fn builder(max_concurrent: usize) -> TaskManagerBuilder {
    TaskManager::builder(Arc::new(TaskRegistry::in_memory())).config(ManagerConfig {
        max_concurrent,
        shutdown_grace: Duration::from_secs(2),
        ..Default::default()
    })
}

fn request(task_type: &str, payload: Value) -> SubmitRequest {
    SubmitRequest {
        task_type: task_type.into(),
        payload,
        timeout_secs: None,
    }
}

/// Poll until the task reaches a terminal status.
async fn settle(service: &TaskService, id: TaskId) -> TaskStatus {
    timeout(TEST_TIMEOUT, async {
        loop {
            let status = service.status(id).await.unwrap().status;
            if status.is_terminal() {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("task did not settle in time")
}

fn ok_worker() -> Arc<dyn Worker> {
    worker_fn(|_, _| async move { Ok(json!({"ok": true})) })
}

#[tokio::test]
async fn scenario_a_all_tasks_complete_under_limit() {
    let manager = builder(2).worker("quick", ok_worker()).start().await.unwrap();
    let service = TaskService::new(manager);

    let mut ids = Vec::new();
    for _ in 0..5 {
        ids.push(service.submit(request("quick", json!({}))).await.unwrap().task_id);
    }
    for id in &ids {
        assert_eq!(settle(&service, *id).await, TaskStatus::Completed);
    }

    let completed = service
        .list(TaskFilter::new().with_status(TaskStatus::Completed))
        .await
        .unwrap();
    assert_eq!(completed.tasks.len(), 5);

    // Newest submission first.
    let listed: Vec<TaskId> = completed.tasks.iter().map(|t| t.task_id).collect();
    let mut expected = ids.clone();
    expected.reverse();
    assert_eq!(listed, expected);
}

#[tokio::test]
async fn scenario_b_worker_error_is_recorded() {
    let manager = builder(1)
        .worker(
            "price",
            worker_fn(|_, _| async move { Err(WorkerError::coded("ValueError", "bad sku")) }),
        )
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    let id = service.submit(request("price", json!({"sku": "x"}))).await.unwrap().task_id;
    assert_eq!(settle(&service, id).await, TaskStatus::Failed);

    let error = service.status(id).await.unwrap().error.unwrap();
    assert_eq!(error.kind, FailureKind::WorkerError);
    assert_eq!(error.code.as_deref(), Some("ValueError"));
    assert!(error.message.contains("bad sku"));

    let err = service.result(id).await.unwrap_err();
    assert!(matches!(err, TaskError::InvalidState { status: TaskStatus::Failed, .. }));
}

#[tokio::test]
async fn scenario_c_cancel_before_admission_never_runs_worker() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let release = Arc::new(tokio::sync::Notify::new());
    let gate = Arc::clone(&release);

    let manager = builder(1)
        .worker(
            "gated",
            worker_fn(move |_, _| {
                let counter = Arc::clone(&counter);
                let gate = Arc::clone(&gate);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    gate.notified().await;
                    Ok(json!(null))
                }
            }),
        )
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    // First task occupies the only slot; second waits behind it.
    let blocker = service.submit(request("gated", json!(1))).await.unwrap().task_id;
    let waiting = service.submit(request("gated", json!(2))).await.unwrap().task_id;

    let cancelled = service.cancel(waiting).await.unwrap();
    assert_eq!(cancelled.status, CancelOutcome::Cancelled);
    assert_eq!(service.status(waiting).await.unwrap().status, TaskStatus::Cancelled);

    release.notify_one();
    assert_eq!(settle(&service, blocker).await, TaskStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let record = service.manager().registry().get(waiting).await.unwrap();
    assert!(record.started_at.is_none());
    assert!(record.result.is_none() && record.error.is_none());
}

#[tokio::test]
async fn scenario_d_progress_then_result() {
    let manager = builder(1)
        .worker(
            "report",
            worker_fn(|_, ctx| async move {
                for percent in [30, 60, 100] {
                    ctx.report_progress(Progress::percent(percent));
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
                Ok(json!({"total": 42}))
            }),
        )
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    let id = service.submit(request("report", json!({}))).await.unwrap().task_id;
    assert_eq!(settle(&service, id).await, TaskStatus::Completed);

    let status = service.status(id).await.unwrap();
    assert_eq!(status.progress.unwrap().percent, 100);
    assert_eq!(service.result(id).await.unwrap().result, json!({"total": 42}));
}

#[tokio::test]
async fn scenario_e_unknown_and_terminal_ids() {
    let manager = builder(1).worker("quick", ok_worker()).start().await.unwrap();
    let service = TaskService::new(manager);

    let err = service.result(TaskId::new()).await.unwrap_err();
    assert!(matches!(err, TaskError::NotFound { .. }));

    let id = service.submit(request("quick", json!({}))).await.unwrap().task_id;
    assert_eq!(settle(&service, id).await, TaskStatus::Completed);

    let response = service.cancel(id).await.unwrap();
    assert_eq!(response.status, CancelOutcome::AlreadyTerminal);
    assert_eq!(service.status(id).await.unwrap().status, TaskStatus::Completed);
}

#[tokio::test]
async fn running_tasks_never_exceed_limit_and_admit_fifo() {
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let order = Arc::new(Mutex::new(Vec::new()));

    let (a, p, o) = (Arc::clone(&active), Arc::clone(&peak), Arc::clone(&order));
    let manager = builder(2)
        .worker(
            "tracked",
            worker_fn(move |payload, _| {
                let (active, peak, order) = (Arc::clone(&a), Arc::clone(&p), Arc::clone(&o));
                async move {
                    order.lock().await.push(payload.as_u64().unwrap_or_default());
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(15)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    Ok(payload)
                }
            }),
        )
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager.clone());

    let mut ids = Vec::new();
    for n in 0..8u64 {
        ids.push(service.submit(request("tracked", json!(n))).await.unwrap().task_id);
        assert!(manager.running_count().await <= 2);
    }
    for id in &ids {
        assert_eq!(settle(&service, *id).await, TaskStatus::Completed);
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert_eq!(*order.lock().await, (0..8).collect::<Vec<u64>>());
}

#[tokio::test]
async fn batch_progress_is_monotonic_and_cancellable() {
    let manager = builder(1)
        .worker(BatchWorker::TASK_TYPE, Arc::new(BatchWorker))
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    let id = service
        .submit(request("batch", json!({"items": 200, "delay_ms": 5})))
        .await
        .unwrap()
        .task_id;

    let mut last = 0u8;
    for _ in 0..10 {
        if let Some(progress) = service.status(id).await.unwrap().progress {
            assert!(progress.percent >= last, "progress went backwards");
            last = progress.percent;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    assert_eq!(service.cancel(id).await.unwrap().status, CancelOutcome::CancelRequested);
    assert_eq!(settle(&service, id).await, TaskStatus::Cancelled);

    let record = service.manager().registry().get(id).await.unwrap();
    assert!(record.progress.unwrap().percent < 100);
    assert!(record.error.is_none());
}

#[tokio::test]
async fn huge_batch_count_is_cancellable() {
    let manager = builder(1)
        .worker(BatchWorker::TASK_TYPE, Arc::new(BatchWorker))
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    let id = service
        .submit(request("batch", json!({"items": 100_000_000_000u64, "delay_ms": 1})))
        .await
        .unwrap()
        .task_id;

    timeout(TEST_TIMEOUT, async {
        loop {
            let progress = service.status(id).await.unwrap().progress;
            if progress.is_some_and(|p| p.items_done.unwrap_or(0) > 0) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("batch made no progress");

    assert_eq!(service.cancel(id).await.unwrap().status, CancelOutcome::CancelRequested);
    assert_eq!(settle(&service, id).await, TaskStatus::Cancelled);

    let progress = service.status(id).await.unwrap().progress.unwrap();
    assert_eq!(progress.items_total, Some(100_000_000_000));
    assert_eq!(progress.percent, 0);
}

#[tokio::test]
async fn event_stream_follows_lifecycle() {
    let manager = builder(1)
        .worker(
            "report",
            worker_fn(|_, ctx| async move {
                ctx.report_progress(Progress::items(1, 2));
                ctx.report_progress(Progress::items(2, 2));
                Ok(json!("done"))
            }),
        )
        .start()
        .await
        .unwrap();
    let events = manager.events();
    tokio::pin!(events);

    let id = manager.submit("report", json!({})).await.unwrap();

    let mut seen = Vec::new();
    timeout(TEST_TIMEOUT, async {
        while let Some(event) = events.next().await {
            let finished = matches!(event, TaskEvent::Finished { .. });
            seen.push(event);
            if finished {
                break;
            }
        }
    })
    .await
    .expect("no finished event");

    assert!(seen.iter().all(|e| e.task_id() == id));
    assert!(matches!(seen[0], TaskEvent::Submitted { .. }));
    assert!(matches!(seen[1], TaskEvent::Started { .. }));
    assert_eq!(
        seen.last(),
        Some(&TaskEvent::Finished {
            task_id: id,
            status: TaskStatus::Completed
        })
    );
    let body = serde_json::to_value(&seen[0]).unwrap();
    assert_eq!(body["event"], json!("submitted"));
}

#[tokio::test]
async fn shutdown_leaves_nothing_active() {
    let manager = builder(2)
        .worker(BatchWorker::TASK_TYPE, Arc::new(BatchWorker))
        .start()
        .await
        .unwrap();

    for _ in 0..5 {
        manager
            .submit("batch", json!({"items": 1000, "delay_ms": 10}))
            .await
            .unwrap();
    }
    timeout(TEST_TIMEOUT, manager.shutdown()).await.unwrap();

    let summary = manager.registry().summary().await.unwrap();
    assert_eq!(summary.total, 5);
    assert_eq!(summary.pending, 0);
    assert_eq!(summary.running, 0);
    assert_eq!(summary.cancelled, 5);
}

#[tokio::test]
async fn retention_sweep_spares_active_tasks() {
    let manager = builder(1).worker("quick", ok_worker()).start().await.unwrap();
    let service = TaskService::new(manager.clone());

    let mut finished = Vec::new();
    for _ in 0..3 {
        let id = manager.submit("quick", json!({})).await.unwrap();
        settle(&service, id).await;
        finished.push(id);
    }
    // A pending record created outside the manager stays untouched.
    let active = manager
        .registry()
        .create("quick".into(), json!({}))
        .await
        .unwrap();

    let sweep = spawn_retention_task(
        Arc::clone(manager.registry()),
        RetentionPolicy {
            max_age: None,
            max_terminal: Some(1),
        },
        Duration::from_millis(10),
    );
    tokio::time::sleep(Duration::from_millis(60)).await;
    sweep.abort();

    let summary = manager.registry().summary().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.pending, 1);
    assert!(manager.registry().get(finished[2]).await.is_ok());
    assert!(manager.registry().get(active.id).await.is_ok());
}

#[tokio::test]
async fn libsql_restart_recovers_pending_and_interrupted() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");

    let (pending, interrupted) = {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_local(&path).await.unwrap());
        let registry = TaskRegistry::new(store).await.unwrap();
        let running = registry.create("echo".into(), json!("was running")).await.unwrap();
        registry.update(running.id, TaskUpdate::Start).await.unwrap();
        let pending = registry.create("echo".into(), json!("waiting")).await.unwrap();
        (pending.id, running.id)
    };

    let store: Arc<dyn TaskStore> = Arc::new(LibSqlTaskStore::new_local(&path).await.unwrap());
    let registry = Arc::new(TaskRegistry::new(store).await.unwrap());
    let manager = TaskManager::builder(registry)
        .worker("echo", worker_fn(|payload, _| async move { Ok(payload) }))
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    assert_eq!(settle(&service, pending).await, TaskStatus::Completed);
    assert_eq!(service.result(pending).await.unwrap().result, json!("waiting"));

    let status = service.status(interrupted).await.unwrap();
    assert_eq!(status.status, TaskStatus::Failed);
    assert_eq!(status.error.unwrap().kind, FailureKind::Interrupted);

    let listed = service.list(TaskFilter::new()).await.unwrap();
    assert_eq!(listed.tasks.len(), 2);
    assert_eq!(listed.tasks[0].task_id, pending);
}

#[tokio::test]
async fn libsql_restart_keeps_per_task_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tasks.db");
    let wait_for_cancel = || {
        worker_fn(|_, ctx| async move {
            ctx.cancelled().await;
            Err(WorkerError::cancelled())
        })
    };

    let id = {
        let registry = Arc::new(TaskRegistry::open(Some(&path)).await.unwrap());
        let manager = TaskManager::builder(registry)
            .worker("wait", wait_for_cancel())
            .config(ManagerConfig {
                max_concurrent: 0,
                ..Default::default()
            })
            .start()
            .await
            .unwrap();
        let mut submit = request("wait", json!({}));
        submit.timeout_secs = Some(1);
        TaskService::new(manager).submit(submit).await.unwrap().task_id
    };

    let registry = Arc::new(TaskRegistry::open(Some(&path)).await.unwrap());
    let manager = TaskManager::builder(registry)
        .worker("wait", wait_for_cancel())
        .start()
        .await
        .unwrap();
    let service = TaskService::new(manager);

    assert_eq!(settle(&service, id).await, TaskStatus::Cancelled);
    let record = service.manager().registry().get(id).await.unwrap();
    assert_eq!(record.timeout_ms, Some(1000));
}
