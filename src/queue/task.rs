//! Task and result records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque task identifier. Random v4 UUIDs, so never reused in practice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of queued work.
#[derive(Debug, Clone)]
pub struct Task<P> {
    pub id: TaskId,
    pub payload: P,
    pub submitted_at: DateTime<Utc>,
    /// Number of tasks already waiting when this one was accepted.
    pub queue_depth: usize,
}

impl<P> Task<P> {
    pub(crate) fn new(payload: P, queue_depth: usize) -> Self {
        Self {
            id: TaskId::generate(),
            payload,
            submitted_at: Utc::now(),
            queue_depth,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Completed,
    Failed,
    Cancelled,
    /// Caller-side only: the wait deadline passed. Never stored.
    Timeout,
    /// Caller-side only: unknown or already purged id. Never stored.
    NotFound,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Timeout => "timeout",
            TaskStatus::NotFound => "not_found",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a task as seen by callers. Always a copy of the stored record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskResult<O> {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub output: Option<O>,
    pub error: Option<String>,
    /// Label reported by the handler for whatever produced the output.
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
}

impl<O> TaskResult<O> {
    pub(crate) fn queued(task_id: TaskId, created_at: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Queued,
            output: None,
            error: None,
            source: None,
            created_at,
            completed_at: None,
            expires_at,
        }
    }

    /// Synthetic record for ids the store does not know.
    pub fn not_found(task_id: TaskId) -> Self {
        let now = Utc::now();
        Self {
            task_id,
            status: TaskStatus::NotFound,
            output: None,
            error: None,
            source: None,
            created_at: now,
            completed_at: None,
            expires_at: now,
        }
    }

    /// Mark a copy as timed out from the caller's point of view.
    pub(crate) fn into_timeout(mut self, reason: &str) -> Self {
        self.status = TaskStatus::Timeout;
        self.output = None;
        self.error = Some(reason.to_string());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}
