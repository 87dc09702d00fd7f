//! SQLite-based task store.

use super::{
    NewTask, StatusCounts, StoreError, TaskPage, TaskQuery, TaskStore, CREATED_CHANNEL_CAPACITY,
};
use crate::task::{now, TaskRecord, TaskStatus, TaskTransition};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    input_path TEXT,
    output_path TEXT,
    url TEXT,
    error TEXT,
    details TEXT,
    request_id TEXT,
    upstream_status INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_created ON tasks(created_at DESC, id DESC);
CREATE INDEX IF NOT EXISTS idx_tasks_status_created ON tasks(status, created_at DESC, id DESC);
"#;

const COLUMNS: &str = "id, status, input_path, output_path, url, error, details, request_id, \
                       upstream_status, created_at, updated_at, finished_at";

pub struct SqliteTaskStore {
    conn: Arc<Mutex<Connection>>,
    created_tx: broadcast::Sender<TaskRecord>,
}

impl SqliteTaskStore {
    pub async fn new(base_dir: PathBuf) -> Result<Self, StoreError> {
        tokio::fs::create_dir_all(&base_dir)
            .await
            .map_err(|e| StoreError::Backend(format!("Failed to create task store dir: {}", e)))?;
        let db_path = base_dir.join("tasks.db");

        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&db_path)
                .map_err(|e| format!("Failed to open SQLite database: {}", e))?;
            conn.execute_batch(SCHEMA)
                .map_err(|e| format!("Failed to run schema: {}", e))?;
            Ok::<_, String>(conn)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("Task join error: {}", e)))?
        .map_err(StoreError::Backend)?;

        let (created_tx, _) = broadcast::channel(CREATED_CHANNEL_CAPACITY);
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            created_tx,
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.blocking_lock();
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Backend(e.to_string()))?
    }
}

fn backend(e: rusqlite::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn row_to_record(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let status_str: String = row.get(1)?;
    let status = TaskStatus::parse(&status_str).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            1,
            Type::Text,
            format!("unknown task status '{}'", status_str).into(),
        )
    })?;
    let details: Option<String> = row.get(6)?;
    let created_at: String = row.get(9)?;
    let updated_at: String = row.get(10)?;
    let finished_at: Option<String> = row.get(11)?;

    Ok(TaskRecord {
        id: row.get(0)?,
        status,
        input_path: row.get(2)?,
        output_path: row.get(3)?,
        url: row.get(4)?,
        error: row.get(5)?,
        details: details.and_then(|s| serde_json::from_str(&s).ok()),
        request_id: row.get(7)?,
        upstream_status: row.get(8)?,
        created_at: parse_ts(9, &created_at)?,
        updated_at: parse_ts(10, &updated_at)?,
        finished_at: finished_at.map(|s| parse_ts(11, &s)).transpose()?,
    })
}

fn load(conn: &Connection, id: &str) -> rusqlite::Result<Option<TaskRecord>> {
    conn.query_row(
        &format!("SELECT {} FROM tasks WHERE id = ?1", COLUMNS),
        params![id],
        row_to_record,
    )
    .optional()
}

fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(err, _) if err.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_task(&self, task: NewTask) -> Result<TaskRecord, StoreError> {
        let record = TaskRecord::new(task.id, task.input_path, now());
        let row = record.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id, status, input_path, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    &row.id,
                    row.status.as_str(),
                    &row.input_path,
                    fmt_ts(&row.created_at),
                    fmt_ts(&row.updated_at),
                ],
            )
            .map_err(|e| {
                if is_constraint_violation(&e) {
                    StoreError::AlreadyExists(row.id.clone())
                } else {
                    backend(e)
                }
            })?;
            Ok(())
        })
        .await?;

        let _ = self.created_tx.send(record.clone());
        Ok(record)
    }

    async fn get_task(&self, id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| load(conn, &id).map_err(backend))
            .await
    }

    async fn transition(
        &self,
        id: &str,
        transition: TaskTransition,
    ) -> Result<TaskRecord, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction().map_err(backend)?;
            let mut record = load(&tx, &id)
                .map_err(backend)?
                .ok_or_else(|| StoreError::NotFound(id.clone()))?;
            record.apply(transition, now())?;

            let details = record
                .details
                .as_ref()
                .map(|d| d.to_string());
            tx.execute(
                "UPDATE tasks SET status = ?2, output_path = ?3, url = ?4, error = ?5,
                        details = ?6, request_id = ?7, upstream_status = ?8,
                        updated_at = ?9, finished_at = ?10
                 WHERE id = ?1",
                params![
                    &record.id,
                    record.status.as_str(),
                    &record.output_path,
                    &record.url,
                    &record.error,
                    details,
                    &record.request_id,
                    record.upstream_status,
                    fmt_ts(&record.updated_at),
                    record.finished_at.as_ref().map(fmt_ts),
                ],
            )
            .map_err(backend)?;
            tx.commit().map_err(backend)?;
            Ok(record)
        })
        .await
    }

    async fn list_tasks(&self, query: TaskQuery) -> Result<TaskPage, StoreError> {
        let limit = query.limit;
        let status = query.status.map(|s| s.as_str());
        let cursor_ts = query.cursor.as_ref().map(|c| fmt_ts(&c.created_at));
        let cursor_id = query.cursor.map(|c| c.id);

        let tasks = self
            .with_conn(move |conn| {
                let mut stmt = conn
                    .prepare(&format!(
                        "SELECT {} FROM tasks
                         WHERE (?1 IS NULL OR status = ?1)
                           AND (?2 IS NULL OR created_at < ?2 OR (created_at = ?2 AND id < ?3))
                         ORDER BY created_at DESC, id DESC
                         LIMIT ?4",
                        COLUMNS
                    ))
                    .map_err(backend)?;
                let rows = stmt
                    .query_map(
                        params![status, cursor_ts, cursor_id, (limit + 1) as i64],
                        row_to_record,
                    )
                    .map_err(backend)?
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(backend)?;
                Ok(rows)
            })
            .await?;

        Ok(TaskPage::from_fetched(tasks, limit))
    }

    async fn tasks_with_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {} FROM tasks WHERE status = ?1 ORDER BY created_at DESC, id DESC",
                    COLUMNS
                ))
                .map_err(backend)?;
            let rows = stmt
                .query_map(params![status.as_str()], row_to_record)
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;
            Ok(rows)
        })
        .await
    }

    async fn count_by_status(&self) -> Result<StatusCounts, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn
                .prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")
                .map_err(backend)?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(backend)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(backend)?;

            let mut counts = StatusCounts::default();
            for (status, n) in rows {
                match TaskStatus::parse(&status) {
                    Some(status) => counts.add(status, n.max(0) as usize),
                    None => tracing::warn!(status = %status, "Ignoring unknown task status"),
                }
            }
            Ok(counts)
        })
        .await
    }

    async fn delete_task(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let affected = conn
                .execute("DELETE FROM tasks WHERE id = ?1", params![id])
                .map_err(backend)?;
            Ok(affected > 0)
        })
        .await
    }

    fn subscribe(&self) -> broadcast::Receiver<TaskRecord> {
        self.created_tx.subscribe()
    }
}
