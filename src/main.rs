use std::path::Path;
use std::sync::Arc;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use task_engine::cli::run_repl;
use task_engine::config::EngineConfig;
use task_engine::service::TaskService;
use task_engine::task::{TaskRegistry, spawn_retention_task};
use task_engine::worker::{TaskManager, WorkerRegistry, register_builtin_workers};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    });

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(config.log_dir.as_deref());

    eprintln!("⚙️  Task Engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Max concurrent: {}", config.manager.max_concurrent);
    match config.manager.task_timeout {
        Some(timeout) => eprintln!("   Task timeout: {:?}", timeout),
        None => eprintln!("   Task timeout: none"),
    }

    // ── Storage ─────────────────────────────────────────────────────────
    let registry = TaskRegistry::open(config.db_path.as_deref())
        .await
        .unwrap_or_else(|e| {
            eprintln!("Error: Failed to open task store: {}", e);
            std::process::exit(1);
        });
    match &config.db_path {
        Some(path) => eprintln!("   Database: {}", path.display()),
        None => eprintln!("   Database: in-memory"),
    }
    let registry = Arc::new(registry);

    // ── Workers + manager ───────────────────────────────────────────────
    let mut workers = WorkerRegistry::new();
    register_builtin_workers(&mut workers);

    let manager = TaskManager::builder(Arc::clone(&registry))
        .workers(workers)
        .config(config.manager.clone())
        .start()
        .await?;

    let retention = spawn_retention_task(
        Arc::clone(&registry),
        config.retention.clone(),
        config.retention_interval,
    );

    let service = TaskService::new(manager.clone());
    tokio::select! {
        result = run_repl(service) => result?,
        _ = tokio::signal::ctrl_c() => eprintln!("\nInterrupted"),
    }

    retention.abort();
    manager.shutdown().await;
    Ok(())
}

fn load_config() -> task_engine::Result<EngineConfig> {
    let config = EngineConfig::from_env()?;
    config.prepare_log_dir()?;
    Ok(config)
}

/// Log to stderr, and to a daily rolling file when `log_dir` is set.
fn init_tracing(log_dir: Option<&Path>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "task-engine.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(stderr_layer)
        .with(file_layer)
        .init();
    guard
}
