//! In-memory task store (non-persistent).

use super::{
    NewTask, StatusCounts, StoreError, TaskPage, TaskQuery, TaskStore,
    CREATED_CHANNEL_CAPACITY,
};
use crate::task::{now, TaskRecord, TaskStatus, TaskTransition};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

#[derive(Clone)]
pub struct InMemoryTaskStore {
    tasks: Arc<RwLock<HashMap<String, TaskRecord>>>,
    created_tx: broadcast::Sender<TaskRecord>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        let (created_tx, _) = broadcast::channel(CREATED_CHANNEL_CAPACITY);
        Self {
            tasks: Arc::new(RwLock::new(HashMap::new())),
            created_tx,
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Newest first; ties broken by id.
fn sort_newest_first(tasks: &mut [TaskRecord]) {
    tasks.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.id.cmp(&a.id))
    });
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new(task.id, task.input_path, now());
        {
            let mut tasks = self.tasks.write().await;
            if tasks.contains_key(&record.id) {
                return Err(StoreError::AlreadyExists(record.id));
            }
            tasks.insert(record.id.clone(), record.clone());
        }
        // No subscribers is fine (e.g. tests without a dispatcher).
        let _ = self.created_tx.send(record.clone());
        Ok(record)
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.tasks.read().await.get(id).cloned())
    }

    async fn transition(
        &self,
        id: &str,
        transition: TaskTransition,
    ) -> Result<TaskRecord, StoreError> {
        let mut tasks = self.tasks.write().await;
        let record = tasks
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.apply(transition, now())?;
        Ok(record.clone())
    }

    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskPage, StoreError> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| query.status.map_or(true, |s| t.status == s))
            .filter(|t| query.cursor.as_ref().map_or(true, |c| c.precedes(t)))
            .cloned()
            .collect();
        sort_newest_first(&mut tasks);
        tasks.truncate(query.limit + 1);
        Ok(TaskPage::from_fetched(tasks, query.limit))
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        let mut tasks: Vec<TaskRecord> = self
            .tasks
            .read()
            .await
            .values()
            .filter(|t| t.status == status)
            .cloned()
            .collect();
        sort_newest_first(&mut tasks);
        Ok(tasks)
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        let mut counts = StatusCounts::default();
        for task in self.tasks.read().await.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tasks.write().await.remove(id).is_some())
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskRecord> {
        self.created_tx.subscribe()
    }
}
