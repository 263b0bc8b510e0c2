//! libSQL backend: durable `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Structured fields
//! (payload, progress, result, error) are stored as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::traits::{TaskFilter, TaskStore};
use crate::task::{Task, TaskId, TaskStatus, TaskType};

/// libSQL task store.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlTaskStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlTaskStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let store = Self::from_database(db).await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_to_json<T: Serialize>(value: &Option<T>) -> Result<Option<String>, DatabaseError> {
    value.as_ref().map(to_json).transpose()
}

fn from_json<T: DeserializeOwned>(column: &str, raw: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw)
        .map_err(|e| DatabaseError::Serialization(format!("column {column}: {e}")))
}

fn opt_from_json<T: DeserializeOwned>(
    column: &str,
    raw: Option<String>,
) -> Result<Option<T>, DatabaseError> {
    raw.map(|r| from_json(column, &r)).transpose()
}

const TASK_COLUMNS: &str = "id, sequence, task_type, status, payload, progress, result, error, created_at, started_at, completed_at, timeout_ms";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let read = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id: String = row.get(0).map_err(read)?;
    let sequence: i64 = row.get(1).map_err(read)?;
    let task_type: String = row.get(2).map_err(read)?;
    let status: String = row.get(3).map_err(read)?;
    let payload: String = row.get(4).map_err(read)?;
    let progress: Option<String> = row.get(5).map_err(read)?;
    let result: Option<String> = row.get(6).map_err(read)?;
    let error: Option<String> = row.get(7).map_err(read)?;
    let created_at: String = row.get(8).map_err(read)?;
    let started_at: Option<String> = row.get(9).map_err(read)?;
    let completed_at: Option<String> = row.get(10).map_err(read)?;
    let timeout_ms: Option<i64> = row.get(11).map_err(read)?;

    Ok(Task {
        id: id
            .parse::<TaskId>()
            .map_err(|e| DatabaseError::Serialization(format!("column id: {e}")))?,
        sequence: sequence.max(0) as u64,
        task_type: TaskType::new(task_type),
        status: status
            .parse::<TaskStatus>()
            .map_err(DatabaseError::Serialization)?,
        payload: from_json("payload", &payload)?,
        progress: opt_from_json("progress", progress)?,
        result: opt_from_json("result", result)?,
        error: opt_from_json("error", error)?,
        timeout_ms: timeout_ms.map(|ms| ms.max(0) as u64),
        created_at: parse_datetime(&created_at),
        started_at: parse_optional_datetime(&started_at),
        completed_at: parse_optional_datetime(&completed_at),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlTaskStore {
    async fn put(&self, task: &Task) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO tasks ({TASK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    task.id.to_string(),
                    task.sequence as i64,
                    task.task_type.as_str(),
                    task.status.as_str(),
                    to_json(&task.payload)?,
                    opt_text(opt_to_json(&task.progress)?),
                    opt_text(opt_to_json(&task.result)?),
                    opt_text(opt_to_json(&task.error)?),
                    task.created_at.to_rfc3339(),
                    opt_text(task.started_at.map(|t| t.to_rfc3339())),
                    opt_text(task.completed_at.map(|t| t.to_rfc3339())),
                    match task.timeout_ms {
                        Some(ms) => libsql::Value::Integer(ms.min(i64::MAX as u64) as i64),
                        None => libsql::Value::Null,
                    },
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("put task: {e}")))?;

        debug!(task_id = %task.id, status = %task.status, "Task persisted");
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get task: {e}"))),
        }
    }

    async fn query(&self, filter: &TaskFilter) -> Result<Vec<Task>, DatabaseError> {
        // LIMIT -1 means no limit in SQLite.
        let limit = filter.limit.map(|l| l as i64).unwrap_or(-1);
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE (?1 IS NULL OR status = ?1) AND (?2 IS NULL OR task_type = ?2)
                     ORDER BY sequence DESC LIMIT ?3"
                ),
                params![
                    opt_text(filter.status.map(|s| s.as_str().to_string())),
                    opt_text(filter.task_type.as_ref().map(|t| t.as_str().to_string())),
                    limit,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query tasks: {e}")))?;

        let mut tasks = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => tasks.push(row_to_task(&row)?),
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("query tasks: {e}"))),
            }
        }
        Ok(tasks)
    }

    async fn remove(&self, ids: &[TaskId]) -> Result<usize, DatabaseError> {
        let mut removed = 0;
        for id in ids {
            removed += self
                .conn()
                .execute("DELETE FROM tasks WHERE id = ?1", params![id.to_string()])
                .await
                .map_err(|e| DatabaseError::Query(format!("remove task: {e}")))?
                as usize;
        }
        Ok(removed)
    }

    async fn max_sequence(&self) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT COALESCE(MAX(sequence), 0) FROM tasks", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("max_sequence: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let max: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("max_sequence: {e}")))?;
                Ok(max.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("max_sequence: {e}"))),
        }
    }
}
