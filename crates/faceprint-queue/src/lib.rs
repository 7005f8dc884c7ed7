//! faceprint-queue: durable task queue shared by the daemon and the workers.
//!
//! Tasks live in one SQLite table in WAL mode, so the daemon can enqueue while
//! workers claim. Lifecycle:
//!
//! ```text
//! queued -> running -> done
//!    ^         |
//!    +---------+ release (attempts left)
//!              +-> dead (attempts exhausted, or payload undecodable)
//! ```
//!
//! All operations are plain functions over a [`rusqlite::Connection`]; async
//! callers drive them through `tokio_rusqlite`.

mod task;

pub use task::{ClaimedTask, TaskId, TaskPayload, TaskRecord, TaskStatus};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const SCHEMA_SQL: &str = include_str!("schema.sql");
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("task payload: {0}")]
    Payload(#[from] serde_json::Error),
    #[error("task {0} not found")]
    NotFound(TaskId),
    #[error("failed to create queue directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Open (creating if needed) the queue database at `path`.
pub fn open(path: &Path) -> Result<Connection, QueueError> {
    create_parent_dir(path)?;
    let conn = Connection::open(path)?;
    initialize(&conn)?;
    tracing::debug!(path = %path.display(), "task queue opened");
    Ok(conn)
}

/// Create the directory that will hold the database file at `path`.
pub fn create_parent_dir(path: &Path) -> Result<(), QueueError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|source| QueueError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    Ok(())
}

/// Schema and pragmas. Idempotent.
pub fn initialize(conn: &Connection) -> Result<(), QueueError> {
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        // In-memory databases report "memory".
        tracing::debug!(mode, "queue database is not in WAL mode");
    }
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch(SCHEMA_SQL)?;
    Ok(())
}

/// Persist a new `queued` task. Durable once this returns.
pub fn enqueue(conn: &Connection, payload: &TaskPayload) -> Result<TaskId, QueueError> {
    let id = TaskId::new();
    let body = serde_json::to_string(payload)?;
    conn.execute(
        "INSERT INTO tasks (id, name, payload, status, attempts, created_at)
         VALUES (?1, ?2, ?3, 'queued', 0, ?4)",
        params![id.to_string(), payload.name(), body, timestamp(Utc::now())],
    )?;
    tracing::info!(task_id = %id, task = payload.name(), "task enqueued");
    Ok(id)
}

/// Move the oldest `queued` task to `running` and hand it out.
///
/// Rows whose payload cannot be decoded are marked `dead` in the same
/// transaction and skipped.
pub fn claim_next(conn: &mut Connection) -> Result<Option<ClaimedTask>, QueueError> {
    let now = timestamp(Utc::now());
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

    let claimed = loop {
        let row = tx
            .query_row(
                "SELECT id, payload, attempts FROM tasks
                 WHERE status = 'queued'
                 ORDER BY created_at, rowid
                 LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((raw_id, payload, attempts)) = row else {
            break None;
        };

        match decode_claim(&raw_id, payload.as_deref()) {
            Ok((id, payload)) => {
                tx.execute(
                    "UPDATE tasks SET status = 'running', attempts = attempts + 1, claimed_at = ?2
                     WHERE id = ?1",
                    params![raw_id, now],
                )?;
                break Some(ClaimedTask {
                    id,
                    payload,
                    attempts: attempts + 1,
                });
            }
            Err(reason) => {
                tracing::warn!(task_id = raw_id, reason, "undecodable task marked dead");
                tx.execute(
                    "UPDATE tasks SET status = 'dead', payload = NULL, error = ?2, finished_at = ?3
                     WHERE id = ?1",
                    params![raw_id, reason, now],
                )?;
            }
        }
    };

    tx.commit()?;
    if let Some(task) = &claimed {
        tracing::info!(task_id = %task.id, task = task.payload.name(), attempt = task.attempts, "task claimed");
    }
    Ok(claimed)
}

fn decode_claim(raw_id: &str, payload: Option<&str>) -> Result<(TaskId, TaskPayload), String> {
    let id = TaskId::parse(raw_id).map_err(|e| format!("bad task id: {e}"))?;
    let payload = payload.ok_or_else(|| "payload missing".to_string())?;
    let payload = serde_json::from_str(payload).map_err(|e| format!("bad payload: {e}"))?;
    Ok((id, payload))
}

/// Record the outcome of a finished task. The payload is dropped.
pub fn complete(
    conn: &Connection,
    id: &TaskId,
    outcome: &serde_json::Value,
) -> Result<(), QueueError> {
    let changed = conn.execute(
        "UPDATE tasks SET status = 'done', payload = NULL, outcome = ?2, error = NULL, finished_at = ?3
         WHERE id = ?1",
        params![id.to_string(), serde_json::to_string(outcome)?, timestamp(Utc::now())],
    )?;
    if changed == 0 {
        return Err(QueueError::NotFound(*id));
    }
    tracing::info!(task_id = %id, "task completed");
    Ok(())
}

/// Give a claimed task back after a failed attempt: `queued` again while
/// attempts remain, `dead` otherwise. Returns the new status.
pub fn release(
    conn: &mut Connection,
    id: &TaskId,
    error: &str,
    max_attempts: u32,
) -> Result<TaskStatus, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let attempts: u32 = tx
        .query_row(
            "SELECT attempts FROM tasks WHERE id = ?1",
            params![id.to_string()],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(QueueError::NotFound(*id))?;
    let status = release_row(&tx, &id.to_string(), attempts, error, max_attempts)?;
    tx.commit()?;
    Ok(status)
}

fn release_row(
    conn: &Connection,
    raw_id: &str,
    attempts: u32,
    error: &str,
    max_attempts: u32,
) -> Result<TaskStatus, QueueError> {
    if attempts >= max_attempts {
        conn.execute(
            "UPDATE tasks SET status = 'dead', payload = NULL, error = ?2, finished_at = ?3
             WHERE id = ?1",
            params![raw_id, error, timestamp(Utc::now())],
        )?;
        tracing::error!(task_id = raw_id, attempts, error, "task attempts exhausted, marked dead");
        Ok(TaskStatus::Dead)
    } else {
        conn.execute(
            "UPDATE tasks SET status = 'queued', error = ?2, claimed_at = NULL WHERE id = ?1",
            params![raw_id, error],
        )?;
        tracing::warn!(task_id = raw_id, attempts, error, "task released for retry");
        Ok(TaskStatus::Queued)
    }
}

/// Release every `running` task claimed before `claimed_before`; these were
/// abandoned by a worker that died mid-task. Returns how many were touched.
pub fn requeue_stale(
    conn: &mut Connection,
    claimed_before: DateTime<Utc>,
    max_attempts: u32,
) -> Result<usize, QueueError> {
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let stale: Vec<(String, u32)> = {
        let mut stmt = tx.prepare(
            "SELECT id, attempts FROM tasks WHERE status = 'running' AND claimed_at < ?1",
        )?;
        let rows = stmt.query_map(params![timestamp(claimed_before)], |row| {
            Ok((row.get(0)?, row.get(1)?))
        })?;
        let stale = rows.collect::<Result<Vec<_>, _>>()?;
        stale
    };

    for (raw_id, attempts) in &stale {
        release_row(&tx, raw_id, *attempts, "worker abandoned task", max_attempts)?;
    }
    tx.commit()?;

    if !stale.is_empty() {
        tracing::warn!(count = stale.len(), "recovered stale running tasks");
    }
    Ok(stale.len())
}

pub fn get(conn: &Connection, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
    let record = conn
        .query_row(
            "SELECT id, name, status, attempts, outcome, error, created_at, claimed_at, finished_at
             FROM tasks WHERE id = ?1",
            params![id.to_string()],
            record_from_row,
        )
        .optional()?;
    Ok(record)
}

/// Number of tasks waiting to be claimed.
pub fn pending(conn: &Connection) -> Result<u64, QueueError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM tasks WHERE status = 'queued'",
        [],
        |row| row.get(0),
    )?;
    Ok(count.max(0) as u64)
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let id: String = row.get(0)?;
    let status: String = row.get(2)?;
    let outcome: Option<String> = row.get(4)?;

    Ok(TaskRecord {
        id: TaskId::parse(&id).map_err(|e| conversion_error(0, e))?,
        name: row.get(1)?,
        status: status
            .parse()
            .map_err(|e: String| conversion_error(2, std::io::Error::other(e)))?,
        attempts: row.get(3)?,
        outcome: outcome
            .map(|text| serde_json::from_str(&text))
            .transpose()
            .map_err(|e| conversion_error(4, e))?,
        error: row.get(5)?,
        created_at: parse_timestamp(row.get(6)?).map_err(|e| conversion_error(6, e))?,
        claimed_at: optional_timestamp(row, 7)?,
        finished_at: optional_timestamp(row, 8)?,
    })
}

fn optional_timestamp(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<String>>(idx)?
        .map(|text| parse_timestamp(text).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn conversion_error(
    idx: usize,
    e: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Fixed-width RFC 3339 so text order is time order.
fn timestamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(text: String) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(&text).map(|t| t.with_timezone(&Utc))
}
