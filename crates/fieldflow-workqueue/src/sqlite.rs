//! SQLite-backed durable task store.
//!
//! Every mutation runs inside a [`Connection::call`] closure. The
//! connection serializes those closures on a single background thread,
//! so claim's select-then-update is atomic and two concurrent claimers
//! observe the transition as linearizable.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{OptionalExtension, Row, params};
use serde_json::Value;
use std::path::Path;
use tokio_rusqlite::Connection;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::QueueError;
use crate::schema::init_schema;
use crate::store::{QueueStats, RetryDisposition, TaskStore, validate_new};
use crate::task::{PriorityTier, Task, TaskStatus};

const TASK_COLUMNS: &str = "id, task_type, payload, priority_tier, priority_weight, status, \
     attempts, max_attempts, created_at, updated_at, scheduled_at, result, last_error, callback_url";

/// Durable task store, one row per task.
pub struct SqliteTaskStore {
    conn: Connection,
}

impl SqliteTaskStore {
    /// Open (or create) a database file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, QueueError> {
        let path = path.as_ref().to_path_buf();
        let conn = Connection::open(&path)
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        conn.call(|conn| {
            conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
            init_schema(conn)
        })
        .await
        .map_err(|e| QueueError::Persistence(e.to_string()))?;

        debug!("SqliteTaskStore initialized at {:?}", path);
        Ok(Self { conn })
    }

    /// Open a private in-memory database.
    pub async fn in_memory() -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        conn.call(|conn| init_schema(conn))
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        Ok(Self { conn })
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    // Fixed-width form so lexicographic order in SQL matches time order.
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn conversion_err(
    idx: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.into())
}

fn parse_ts(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, e))
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<Task> {
    let id: String = row.get(0)?;
    let task_type: String = row.get(1)?;
    let payload: String = row.get(2)?;
    let tier: i64 = row.get(3)?;
    let weight: i32 = row.get(4)?;
    let status: String = row.get(5)?;
    let attempts: u32 = row.get(6)?;
    let max_attempts: u32 = row.get(7)?;
    let created_at: String = row.get(8)?;
    let updated_at: String = row.get(9)?;
    let scheduled_at: Option<String> = row.get(10)?;
    let result: Option<String> = row.get(11)?;
    let last_error: Option<String> = row.get(12)?;
    let callback_url: Option<String> = row.get(13)?;

    Ok(Task {
        id: Uuid::parse_str(&id).map_err(|e| conversion_err(0, e))?,
        task_type,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_err(2, e))?,
        priority: PriorityTier::from_code(tier)
            .ok_or_else(|| conversion_err(3, format!("unknown priority tier {tier}")))?,
        weight,
        status: TaskStatus::parse(&status)
            .ok_or_else(|| conversion_err(5, format!("unknown status '{status}'")))?,
        attempts,
        max_attempts,
        created_at: parse_ts(8, &created_at)?,
        updated_at: parse_ts(9, &updated_at)?,
        scheduled_at: scheduled_at.as_deref().map(|s| parse_ts(10, s)).transpose()?,
        result: result
            .as_deref()
            .map(|s| serde_json::from_str(s).map_err(|e| conversion_err(11, e)))
            .transpose()?,
        last_error,
        callback_url,
    })
}

enum CompleteOutcome {
    Done,
    AlreadyTerminal(TaskStatus),
    Missing,
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), QueueError> {
        validate_new(task)?;

        let t = task.clone();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO tasks (id, task_type, payload, priority_tier, priority_weight, \
                     status, attempts, max_attempts, created_at, updated_at, scheduled_at, \
                     result, last_error, callback_url) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
                    params![
                        t.id.to_string(),
                        t.task_type,
                        serde_json::to_string(&t.payload).unwrap_or_else(|_| "null".into()),
                        t.priority.code(),
                        t.weight,
                        t.status.as_str(),
                        t.attempts,
                        t.max_attempts,
                        ts(&t.created_at),
                        ts(&t.updated_at),
                        t.scheduled_at.as_ref().map(ts),
                        t.result
                            .as_ref()
                            .map(|r| serde_json::to_string(r).unwrap_or_else(|_| "null".into())),
                        t.last_error,
                        t.callback_url,
                    ],
                )?;
                Ok(())
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))
    }

    async fn claim_next(&self, tiers: &[PriorityTier]) -> Result<Option<Task>, QueueError> {
        let tier_codes: Vec<i64> = tiers.iter().map(|t| t.code()).collect();
        let now = Utc::now();
        let now_s = ts(&now);

        let claimed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut claimed = None;

                let select = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'pending' AND priority_tier = ?1 \
                       AND (scheduled_at IS NULL OR scheduled_at <= ?2) \
                     ORDER BY priority_weight DESC, created_at ASC \
                     LIMIT 1"
                );

                for code in tier_codes {
                    let task = tx
                        .query_row(&select, params![code, now_s], row_to_task)
                        .optional()?;

                    if let Some(mut task) = task {
                        tx.execute(
                            "UPDATE tasks SET status = 'processing', updated_at = ?2 WHERE id = ?1",
                            params![task.id.to_string(), now_s],
                        )?;
                        task.status = TaskStatus::Processing;
                        task.updated_at = now;
                        claimed = Some(task);
                        break;
                    }
                }

                tx.commit()?;
                Ok(claimed)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        if let Some(ref task) = claimed {
            debug!("Claimed task {} ({:?})", task.id, task.priority);
        }
        Ok(claimed)
    }

    async fn complete(&self, id: Uuid, result: Value) -> Result<(), QueueError> {
        let id_s = id.to_string();
        let result_s =
            serde_json::to_string(&result).map_err(|e| QueueError::Persistence(e.to_string()))?;
        let now_s = ts(&Utc::now());

        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let status: Option<String> = tx
                    .query_row("SELECT status FROM tasks WHERE id = ?1", [&id_s], |r| r.get(0))
                    .optional()?;

                let outcome = match status.as_deref().and_then(TaskStatus::parse) {
                    None => CompleteOutcome::Missing,
                    Some(s) if s.is_terminal() => CompleteOutcome::AlreadyTerminal(s),
                    Some(_) => {
                        tx.execute(
                            "UPDATE tasks SET status = 'completed', result = ?2, updated_at = ?3 \
                             WHERE id = ?1",
                            params![id_s, result_s, now_s],
                        )?;
                        CompleteOutcome::Done
                    }
                };

                tx.commit()?;
                Ok(outcome)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        match outcome {
            CompleteOutcome::Done => Ok(()),
            CompleteOutcome::AlreadyTerminal(status) => {
                if status == TaskStatus::DeadLetter {
                    warn!("Ignoring completion of dead-lettered task {}", id);
                }
                Ok(())
            }
            CompleteOutcome::Missing => Err(QueueError::TaskNotFound(id)),
        }
    }

    async fn retry(
        &self,
        id: Uuid,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<RetryDisposition, QueueError> {
        let id_s = id.to_string();
        let error = error.to_string();
        let retry_at_s = ts(&retry_at);
        let now_s = ts(&Utc::now());

        let disposition = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let counts: Option<(u32, u32)> = tx
                    .query_row(
                        "SELECT attempts, max_attempts FROM tasks WHERE id = ?1",
                        [&id_s],
                        |r| Ok((r.get(0)?, r.get(1)?)),
                    )
                    .optional()?;

                let disposition = match counts {
                    None => None,
                    Some((attempts, max_attempts)) => {
                        let attempts = attempts + 1;
                        if attempts < max_attempts {
                            tx.execute(
                                "UPDATE tasks SET status = 'pending', attempts = ?2, \
                                 last_error = ?3, scheduled_at = ?4, updated_at = ?5 \
                                 WHERE id = ?1",
                                params![id_s, attempts, error, retry_at_s, now_s],
                            )?;
                            Some(RetryDisposition::Scheduled(retry_at))
                        } else {
                            tx.execute(
                                "UPDATE tasks SET status = 'dead_letter', attempts = ?2, \
                                 last_error = ?3, scheduled_at = NULL, updated_at = ?4 \
                                 WHERE id = ?1",
                                params![id_s, attempts, error, now_s],
                            )?;
                            Some(RetryDisposition::DeadLettered)
                        }
                    }
                };

                tx.commit()?;
                Ok(disposition)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        disposition.ok_or(QueueError::TaskNotFound(id))
    }

    async fn dead_letter(&self, id: Uuid, error: &str) -> Result<(), QueueError> {
        let id_s = id.to_string();
        let error = error.to_string();
        let now_s = ts(&Utc::now());

        let found = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'dead_letter', last_error = ?2, \
                     scheduled_at = NULL, updated_at = ?3 \
                     WHERE id = ?1 AND status != 'dead_letter'",
                    params![id_s, error, now_s],
                )?;
                if changed > 0 {
                    return Ok(true);
                }
                let exists: Option<i64> = conn
                    .query_row("SELECT 1 FROM tasks WHERE id = ?1", [&id_s], |r| r.get(0))
                    .optional()?;
                Ok(exists.is_some())
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        if found { Ok(()) } else { Err(QueueError::TaskNotFound(id)) }
    }

    async fn get(&self, id: Uuid) -> Result<Task, QueueError> {
        let id_s = id.to_string();

        let task = self
            .conn
            .call(move |conn| {
                let select = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1");
                Ok(conn.query_row(&select, [&id_s], row_to_task).optional()?)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        task.ok_or(QueueError::TaskNotFound(id))
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare("SELECT status, COUNT(*) FROM tasks GROUP BY status")?;
                let rows = stmt.query_map([], |r| {
                    Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
                })?;

                let mut stats = QueueStats::default();
                for row in rows {
                    let (status, count) = row?;
                    if let Some(status) = TaskStatus::parse(&status) {
                        stats.count(status, count);
                    }
                }
                Ok(stats)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))
    }

    async fn dead_letter_tasks(&self) -> Result<Vec<Task>, QueueError> {
        self.conn
            .call(|conn| {
                let select = format!(
                    "SELECT {TASK_COLUMNS} FROM tasks \
                     WHERE status = 'dead_letter' ORDER BY created_at ASC"
                );
                let mut stmt = conn.prepare(&select)?;
                let rows = stmt.query_map([], row_to_task)?;
                Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))
    }

    async fn reclaim_processing(&self) -> Result<u64, QueueError> {
        let now_s = ts(&Utc::now());

        let reclaimed = self
            .conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE tasks SET status = 'pending', updated_at = ?1 \
                     WHERE status = 'processing'",
                    [&now_s],
                )?;
                Ok(changed as u64)
            })
            .await
            .map_err(|e| QueueError::Persistence(e.to_string()))?;

        if reclaimed > 0 {
            warn!("Reclaimed {} tasks stranded in processing", reclaimed);
        }
        Ok(reclaimed)
    }
}
