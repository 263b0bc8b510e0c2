//! Task Engine: asynchronous background task processing.
//!
//! Callers submit typed units of work and get an id back immediately; a
//! bounded pool of pluggable workers executes them while callers poll
//! status, progress and results, or cancel them cooperatively.

pub mod cli;
pub mod config;
pub mod error;
pub mod service;
pub mod store;
pub mod task;
pub mod worker;

pub use error::{Error, Result};
