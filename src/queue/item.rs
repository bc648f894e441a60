//! Task Store record types (§3 Task data model, §4.8).

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::model::TaskKind;

/// Status of a task (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InFlight,
    Done,
    Failed,
    Quarantined,
    Skipped,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InFlight => "in_flight",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Quarantined => "quarantined",
            Self::Skipped => "skipped",
        }
    }

    /// Terminal statuses never transition further (§3 invariant).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Quarantined | Self::Skipped)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in_flight" => Ok(Self::InFlight),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "quarantined" => Ok(Self::Quarantined),
            "skipped" => Ok(Self::Skipped),
            other => Err(format!("invalid task status: {other}")),
        }
    }
}

/// A durable task row (§4.8).
#[derive(Debug, Clone, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub kind: String,
    pub remote_id: String,
    pub target_path: Option<String>,
    pub dedup_key: String,
    pub payload: String,
    #[sqlx(rename = "status")]
    pub status_str: String,
    pub attempts: i64,
    pub integrity_failures: i64,
    pub last_error_class: Option<String>,
    pub last_error_message: Option<String>,
    pub created_at: String,
    pub updated_at: String,
    pub not_before: Option<String>,
}

impl TaskRecord {
    #[must_use]
    pub fn status(&self) -> TaskStatus {
        self.status_str.parse().unwrap_or(TaskStatus::Pending)
    }

    #[must_use]
    pub fn task_kind(&self) -> Option<TaskKind> {
        self.kind.parse().ok()
    }

    /// Deserializes the opaque JSON payload.
    ///
    /// # Errors
    /// Returns a `serde_json::Error` if the stored payload does not match `T`.
    pub fn payload_as<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Builds the idempotency key enforced by `enqueue`'s unique index (§4.8:
/// "idempotent by (kind, remote-id, target-path)").
#[must_use]
pub fn dedup_key(kind: TaskKind, remote_id: &str, target_path: Option<&str>) -> String {
    format!("{}:{}:{}", kind.as_str(), remote_id, target_path.unwrap_or(""))
}
