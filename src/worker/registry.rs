//! Worker registry keyed by task type.

use std::collections::HashMap;
use std::sync::Arc;

use crate::task::TaskType;
use crate::worker::worker::Worker;

/// Maps each task type to the worker that executes it.
///
/// Populated before the manager starts and read-only afterwards.
#[derive(Default, Clone)]
pub struct WorkerRegistry {
    workers: HashMap<TaskType, Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous one for the same type.
    pub fn register(&mut self, task_type: impl Into<TaskType>, worker: Arc<dyn Worker>) {
        let task_type = task_type.into();
        if self.workers.insert(task_type.clone(), worker).is_some() {
            tracing::warn!(task_type = %task_type, "Replaced previously registered worker");
        } else {
            tracing::debug!("Registered worker: {}", task_type);
        }
    }

    /// Get the worker for a task type.
    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn Worker>> {
        self.workers.get(task_type).cloned()
    }

    pub fn contains(&self, task_type: &TaskType) -> bool {
        self.workers.contains_key(task_type)
    }

    /// Registered task types, sorted.
    pub fn types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.workers.keys().cloned().collect();
        types.sort();
        types
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }
}

impl std::fmt::Debug for WorkerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerRegistry")
            .field("types", &self.types())
            .finish()
    }
}
