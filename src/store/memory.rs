//! In-memory task store: the default backend.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;
use crate::store::traits::{TaskFilter, TaskStore};
use crate::task::{Task, TaskId};

/// Task records kept in a `HashMap` behind an async `RwLock`.
///
/// Contents are lost when the process exits.
#[derive(Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn put(&self, task: &Task) -> Result<(), DatabaseError> {
        self.tasks.write().await.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        Ok(self.tasks.read().await.get(&id).cloned())
    }

    async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        let mut matched: Vec<Task> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        if let Some(limit) = filter.limit {
            matched.truncate(limit);
        }
        Ok(matched)
    }

    async fn remove(&self, ids: &[TaskId]) -> Result<usize, DatabaseError> {
        let mut tasks = self.tasks.write().await;
        Ok(ids.iter().filter(|id| tasks.remove(id).is_some()).count())
    }

    async fn max_sequence(&self) -> Result<u64, DatabaseError> {
        Ok(self
            .tasks
            .read()
            .await
            .values()
            .map(|t| t.sequence)
            .max()
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::task::{TaskStatus, TaskType, TaskUpdate};

    fn make_task(sequence: u64, task_type: &str) -> Task {
        Task::new(sequence, TaskType::new(task_type), json!({}))
    }

    #[tokio::test]
    async fn put_and_get() {
        let store = InMemoryTaskStore::new();
        let task = make_task(1, "echo");
        store.put(&task).await.unwrap();

        let fetched = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(fetched, task);
        assert!(store.get(TaskId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn query_is_newest_first_and_limited() {
        let store = InMemoryTaskStore::new();
        for seq in 1..=5 {
            store.put(&make_task(seq, "echo")).await.unwrap();
        }

        let all = store.query(&TaskFilter::new()).await.unwrap();
        let seqs: Vec<u64> = all.iter().map(|t| t.sequence).collect();
        assert_eq!(seqs, vec![5, 4, 3, 2, 1]);

        let two = store.query(&TaskFilter::new().with_limit(2)).await.unwrap();
        assert_eq!(two.len(), 2);
        assert_eq!(two[0].sequence, 5);
    }

    #[tokio::test]
    async fn query_filters_by_status_and_type() {
        let store = InMemoryTaskStore::new();
        let mut running = make_task(1, "batch");
        running.apply(TaskUpdate::Start).unwrap();
        store.put(&running).await.unwrap();
        store.put(&make_task(2, "batch")).await.unwrap();
        store.put(&make_task(3, "echo")).await.unwrap();

        let batch = store
            .query(&TaskFilter::new().with_type("batch"))
            .await
            .unwrap();
        assert_eq!(batch.len(), 2);

        let pending_batch = store
            .query(
                &TaskFilter::new()
                    .with_type("batch")
                    .with_status(TaskStatus::Pending),
            )
            .await
            .unwrap();
        assert_eq!(pending_batch.len(), 1);
        assert_eq!(pending_batch[0].sequence, 2);
    }

    #[tokio::test]
    async fn remove_counts_existing_only() {
        let store = InMemoryTaskStore::new();
        let task = make_task(1, "echo");
        store.put(&task).await.unwrap();

        let removed = store.remove(&[task.id, TaskId::new()]).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.query(&TaskFilter::new()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn max_sequence_tracks_highest() {
        let store = InMemoryTaskStore::new();
        assert_eq!(store.max_sequence().await.unwrap(), 0);
        store.put(&make_task(7, "echo")).await.unwrap();
        store.put(&make_task(3, "echo")).await.unwrap();
        assert_eq!(store.max_sequence().await.unwrap(), 7);
    }
}
