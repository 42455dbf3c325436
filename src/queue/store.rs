//! Shared result table.
//!
//! Written once per task transition, read by any number of waiters. Every
//! write replaces a whole record under the write lock, so readers never see
//! a half-updated result.

use super::task::{TaskId, TaskResult, TaskStatus};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

/// Terminal transition applied by a worker or by shutdown.
#[derive(Debug)]
pub(crate) enum Finish<O> {
    Completed { output: O, source: Option<String> },
    Failed { error: String },
    Cancelled { reason: String },
}

pub(crate) struct ResultStore<O> {
    entries: RwLock<HashMap<TaskId, TaskResult<O>>>,
    ttl: ChronoDuration,
}

impl<O: Clone> ResultStore<O> {
    pub(crate) fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl: ChronoDuration::from_std(ttl).unwrap_or_else(|_| ChronoDuration::seconds(300)),
        }
    }

    pub(crate) fn insert_queued(&self, id: TaskId) {
        let now = Utc::now();
        let record = TaskResult::queued(id.clone(), now, now + self.ttl);
        self.entries.write().insert(id, record);
    }

    /// Move a queued entry to a terminal state. Returns false when the entry
    /// is unknown, already purged, or already terminal.
    pub(crate) fn finish(&self, id: &TaskId, finish: Finish<O>) -> bool {
        let mut entries = self.entries.write();
        let Some(current) = entries.get(id) else {
            return false;
        };
        if current.status.is_terminal() {
            return false;
        }

        let now = Utc::now();
        let mut record = TaskResult::queued(id.clone(), current.created_at, now + self.ttl);
        record.completed_at = Some(now);
        match finish {
            Finish::Completed { output, source } => {
                record.status = TaskStatus::Completed;
                record.output = Some(output);
                record.source = source;
            }
            Finish::Failed { error } => {
                record.status = TaskStatus::Failed;
                record.error = Some(error);
            }
            Finish::Cancelled { reason } => {
                record.status = TaskStatus::Cancelled;
                record.error = Some(reason);
            }
        }
        entries.insert(id.clone(), record);
        true
    }

    /// Drop an entry whose task never made it into the queue.
    pub(crate) fn remove(&self, id: &TaskId) {
        self.entries.write().remove(id);
    }

    pub(crate) fn get(&self, id: &TaskId) -> Option<TaskResult<O>> {
        self.entries.read().get(id).cloned()
    }

    /// Delete terminal entries whose expiry has passed. Queued entries stay
    /// until a worker or shutdown finishes them.
    pub(crate) fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, r| !(r.status.is_terminal() && r.expires_at < now));
        let removed = before - entries.len();
        if removed > 0 {
            debug!(removed, remaining = entries.len(), "purged expired task results");
        }
        removed
    }

    pub(crate) fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.read().len()
    }
}
