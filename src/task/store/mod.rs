//! Task storage module with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for testing)
//! - `sqlite`: SQLite database
//!
//! Every backend publishes newly created records on a broadcast channel; the
//! trigger dispatcher subscribes to it.

mod memory;
mod sqlite;

pub use memory::InMemoryTaskStore;
pub use sqlite::SqliteTaskStore;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use tokio::sync::broadcast;

use super::{InvalidTransition, TaskRecord, TaskStatus, TaskTransition};

/// Capacity of the creation-event channel.
pub(crate) const CREATED_CHANNEL_CAPACITY: usize = 256;

/// Largest page the list endpoint will return.
pub const MAX_PAGE_SIZE: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Task {0} not found")]
    NotFound(String),

    #[error("Task {0} already exists")]
    AlreadyExists(String),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    #[error("Invalid cursor")]
    InvalidCursor,

    #[error("Task store backend error: {0}")]
    Backend(String),
}

/// Input for creating a task record.
#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub input_path: Option<String>,
}

/// Position after the last record of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl TaskCursor {
    pub fn after(record: &TaskRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id.clone(),
        }
    }

    /// Opaque URL-safe token.
    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at
                .to_rfc3339_opts(chrono::SecondsFormat::Micros, true),
            self.id
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, StoreError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|_| StoreError::InvalidCursor)?;
        let raw = String::from_utf8(bytes).map_err(|_| StoreError::InvalidCursor)?;
        let (ts, id) = raw.split_once('|').ok_or(StoreError::InvalidCursor)?;
        let created_at = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| StoreError::InvalidCursor)?
            .with_timezone(&Utc);
        if id.is_empty() {
            return Err(StoreError::InvalidCursor);
        }
        Ok(Self {
            created_at,
            id: id.to_string(),
        })
    }

    /// Whether `record` sorts strictly after this cursor (newest first).
    pub fn precedes(&self, record: &TaskRecord) -> bool {
        record.created_at < self.created_at
            || (record.created_at == self.created_at && record.id.as_str() < self.id.as_str())
    }
}

/// Filter and page selection for listing records.
#[derive(Debug, Clone)]
pub struct TaskQuery {
    pub status: Option<TaskStatus>,
    pub limit: usize,
    pub cursor: Option<TaskCursor>,
}

impl Default for TaskQuery {
    fn default() -> Self {
        Self {
            status: None,
            limit: 50,
            cursor: None,
        }
    }
}

/// One page of records, newest first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub tasks: Vec<TaskRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

impl TaskPage {
    /// Build a page from up to `limit + 1` fetched records.
    pub(crate) fn from_fetched(mut tasks: Vec<TaskRecord>, limit: usize) -> Self {
        let next_cursor = if tasks.len() > limit {
            tasks.truncate(limit);
            tasks.last().map(|r| TaskCursor::after(r).encode())
        } else {
            None
        };
        Self { tasks, next_cursor }
    }
}

/// Number of records per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub queued: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
}

impl StatusCounts {
    pub fn add(&mut self, status: TaskStatus, n: usize) {
        match status {
            TaskStatus::Queued => self.queued += n,
            TaskStatus::Processing => self.processing += n,
            TaskStatus::Done => self.done += n,
            TaskStatus::Error => self.error += n,
        }
    }

    pub fn total(&self) -> usize {
        self.queued + self.processing + self.done + self.error
    }
}

/// Task store trait - implemented by all storage backends.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    /// Create a new `Queued` record and announce it to subscribers.
    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, StoreError>;

    /// Get a single record by id.
    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Apply a status transition atomically, returning the updated record.
    async fn transition(
        &self,
        id: &str,
        transition: TaskTransition,
    ) -> Result<TaskRecord, StoreError>;

    /// List records ordered by `created_at` then `id`, newest first.
    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskPage, StoreError>;

    /// Every record currently in `status`.
    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError>;

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError>;

    /// Administrative deletion.
    async fn delete_task(&self, id: &str) -> Result<bool, StoreError>;

    /// Receive every record created from now on.
    fn subscribe(&self) -> broadcast::Receiver<TaskRecord>;
}

/// Task store type selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskStoreType {
    Memory,
    #[default]
    Sqlite,
}

impl TaskStoreType {
    /// Parse from environment variable value.
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "memory" => Self::Memory,
            "sqlite" | "db" => Self::Sqlite,
            _ => Self::default(),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqlite => "sqlite",
        }
    }
}

/// Create a task store based on type and configuration.
pub async fn create_task_store(
    store_type: TaskStoreType,
    base_dir: PathBuf,
) -> Result<Box<dyn TaskStore>, StoreError> {
    match store_type {
        TaskStoreType::Memory => Ok(Box::new(InMemoryTaskStore::new())),
        TaskStoreType::Sqlite => {
            let store = SqliteTaskStore::new(base_dir).await?;
            Ok(Box::new(store))
        }
    }
}
