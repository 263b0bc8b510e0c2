//! Worker system: the worker contract and the task manager that runs it.
//!
//! Core components:
//! - `worker`: the `Worker` trait and closure adapter
//! - `context`: per-run `WorkerContext` (progress sink + cancellation token)
//! - `registry`: task type → worker table
//! - `builtin`: demo workers (echo, batch, fail)
//! - `scheduler`: `TaskManager`: admission, execution, cancellation, timeouts

pub mod builtin;
pub mod context;
pub mod registry;
pub mod scheduler;
pub mod worker;

pub use builtin::{BatchWorker, EchoWorker, FailWorker, register_builtin_workers};
pub use context::WorkerContext;
pub use registry::WorkerRegistry;
pub use scheduler::{CancelOutcome, SubmitOptions, TaskEvent, TaskManager, TaskManagerBuilder};
pub use worker::{FnWorker, Worker, worker_fn};
