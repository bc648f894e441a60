//! Task Store (C8, §4.8): durable, crash-safe record of every unit of work.

mod error;
mod item;

pub use error::{QueueDbErrorKind, QueueError};
pub use item::{dedup_key, TaskRecord, TaskStatus};

use std::time::Duration;

use sqlx::Row;
use tracing::{info, instrument, warn};

use crate::db::Database;
use crate::model::TaskKind;

type Result<T> = std::result::Result<T, QueueError>;

/// Checkpoint after every 50 state transitions (§4.8).
const CHECKPOINT_EVERY_N_TRANSITIONS: i64 = 50;
/// ...or every 5 seconds, whichever comes first (§4.8).
const CHECKPOINT_EVERY_SECS: f64 = 5.0;

/// The durable Task Store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueues a task, idempotent by (kind, remote-id, target-path) (§4.8).
    ///
    /// Returns the existing row untouched if the dedup key already exists.
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    #[instrument(skip(self, payload))]
    pub async fn enqueue(
        &self,
        kind: TaskKind,
        remote_id: &str,
        target_path: Option<&str>,
        payload: &serde_json::Value,
    ) -> Result<TaskRecord> {
        let id = uuid_v4();
        let key = dedup_key(kind, remote_id, target_path);
        let payload_str = payload.to_string();

        sqlx::query(
            "INSERT INTO tasks (id, kind, remote_id, target_path, dedup_key, payload, status)
             VALUES (?, ?, ?, ?, ?, ?, 'pending')
             ON CONFLICT(dedup_key) DO NOTHING",
        )
        .bind(&id)
        .bind(kind.as_str())
        .bind(remote_id)
        .bind(target_path)
        .bind(&key)
        .bind(&payload_str)
        .execute(self.db.pool())
        .await?;

        self.get_by_dedup_key(&key)
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(key))
    }

    async fn get_by_dedup_key(&self, key: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE dedup_key = ?")
            .bind(key)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    /// Atomically claims at most `limit` pending tasks whose `kind` is in `kinds`, marking
    /// them `in_flight` (§4.8, §4.9 FIFO-by-(creation-time, id) claim order).
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    #[instrument(skip(self))]
    pub async fn claim(&self, limit: i64, kinds: &[TaskKind]) -> Result<Vec<TaskRecord>> {
        if kinds.is_empty() || limit <= 0 {
            return Ok(Vec::new());
        }
        let placeholders = kinds.iter().map(|_| "?").collect::<Vec<_>>().join(",");
        let sql = format!(
            "UPDATE tasks SET status = 'in_flight', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id IN (
                SELECT id FROM tasks
                WHERE status = 'pending' AND kind IN ({placeholders})
                  AND (not_before IS NULL OR not_before <= strftime('%Y-%m-%dT%H:%M:%fZ','now'))
                ORDER BY created_at ASC, id ASC
                LIMIT ?
             )
             RETURNING *"
        );

        let mut query = sqlx::query_as::<_, TaskRecord>(&sql);
        for kind in kinds {
            query = query.bind(kind.as_str());
        }
        query = query.bind(limit);

        let claimed = query.fetch_all(self.db.pool()).await?;
        if !claimed.is_empty() {
            self.record_transitions(claimed.len() as i64).await?;
        }
        Ok(claimed)
    }

    /// Marks a task's terminal outcome (§4.8 `complete`).
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    #[instrument(skip(self))]
    pub async fn complete(
        &self,
        id: &str,
        terminal_status: TaskStatus,
        error_class: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE tasks
             SET status = ?, last_error_class = ?, last_error_message = ?,
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?",
        )
        .bind(terminal_status.as_str())
        .bind(error_class)
        .bind(error_message)
        .bind(id)
        .execute(self.db.pool())
        .await?;
        self.record_transitions(1).await?;
        Ok(())
    }

    /// Requeues a task for retry after `delay`, incrementing its attempt count (§4.8 `requeue`).
    ///
    /// `is_integrity_failure` tracks the *consecutive* integrity-failure streak separately
    /// from the generic `attempts` counter (§4.3): a digest mismatch increments it, any
    /// other failure class resets it to zero.
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    #[instrument(skip(self))]
    pub async fn requeue(
        &self,
        id: &str,
        delay: Duration,
        error_class: Option<&str>,
        error_message: Option<&str>,
        is_integrity_failure: bool,
    ) -> Result<()> {
        let delay_secs = delay.as_secs_f64();
        let integrity_expr = if is_integrity_failure {
            "integrity_failures + 1"
        } else {
            "0"
        };
        let sql = format!(
            "UPDATE tasks
             SET status = 'pending', attempts = attempts + 1,
                 integrity_failures = {integrity_expr},
                 last_error_class = ?, last_error_message = ?,
                 not_before = strftime('%Y-%m-%dT%H:%M:%fZ', 'now', '+' || ? || ' seconds'),
                 updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = ?"
        );
        sqlx::query(&sql)
            .bind(error_class)
            .bind(error_message)
            .bind(delay_secs)
            .bind(id)
            .execute(self.db.pool())
            .await?;
        self.record_transitions(1).await?;
        Ok(())
    }

    /// Moves every `in_flight` task back to `pending` (crash recovery, §4.8 `resume`).
    ///
    /// Returns the number of tasks moved.
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    #[instrument(skip(self))]
    pub async fn resume(&self) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE tasks SET status = 'pending', updated_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE status = 'in_flight'",
        )
        .execute(self.db.pool())
        .await?;
        let moved = result.rows_affected();
        if moved > 0 {
            warn!(moved, "resumed in-flight tasks back to pending after restart");
        }
        Ok(moved)
    }

    /// Returns the count of tasks in a status.
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    pub async fn count_by_status(&self, status: TaskStatus) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) as c FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(row.try_get::<i64, _>("c")?)
    }

    /// Returns all tasks currently `in_flight` (used by the startup resume scan).
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    pub async fn list_in_flight(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE status = 'in_flight'")
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows)
    }

    /// Returns all tasks in a terminal status (used as skip gates on resume, §4.6).
    ///
    /// # Errors
    /// Returns [`QueueError`] on database failure.
    pub async fn list_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE status = ?")
            .bind(status.as_str())
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows)
    }

    /// Returns a single task by id.
    ///
    /// # Errors
    /// Returns [`QueueError::TaskNotFound`] if absent, or a database error.
    pub async fn get(&self, id: &str) -> Result<TaskRecord> {
        sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| QueueError::TaskNotFound(id.to_string()))
    }

    /// Increments the checkpoint counter and rotates the `.bak` file once the threshold is
    /// crossed (every 50 transitions or 5 seconds, whichever first, §4.8).
    async fn record_transitions(&self, count: i64) -> Result<()> {
        let row = sqlx::query(
            "UPDATE checkpoint_state
             SET transitions_since_checkpoint = transitions_since_checkpoint + ?
             WHERE id = 1
             RETURNING transitions_since_checkpoint,
                       (julianday('now') - julianday(last_checkpoint_at)) * 86400.0 AS elapsed_secs",
        )
        .bind(count)
        .fetch_one(self.db.pool())
        .await?;

        let transitions: i64 = row.try_get("transitions_since_checkpoint")?;
        let elapsed_secs: f64 = row.try_get("elapsed_secs")?;

        if transitions >= CHECKPOINT_EVERY_N_TRANSITIONS || elapsed_secs >= CHECKPOINT_EVERY_SECS {
            self.checkpoint().await?;
        }
        Ok(())
    }

    /// Forces a checkpoint now: rotates the `.bak` file and resets the transition counter.
    ///
    /// # Errors
    /// Returns [`QueueError`] on database or filesystem failure.
    #[instrument(skip(self))]
    pub async fn checkpoint(&self) -> Result<()> {
        self.db.rotate_backup().await.map_err(|e| QueueError::Database {
            kind: QueueDbErrorKind::Io,
            message: e.to_string(),
        })?;

        sqlx::query(
            "UPDATE checkpoint_state
             SET transitions_since_checkpoint = 0,
                 last_checkpoint_at = strftime('%Y-%m-%dT%H:%M:%fZ','now')
             WHERE id = 1",
        )
        .execute(self.db.pool())
        .await?;

        info!("task store checkpoint complete");
        Ok(())
    }
}

/// Minimal UUID v4 generator (avoids an extra `uuid` crate dependency for one call site).
fn uuid_v4() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes[6] = (bytes[6] & 0x0f) | 0x40;
    bytes[8] = (bytes[8] & 0x3f) | 0x80;
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    )
}
