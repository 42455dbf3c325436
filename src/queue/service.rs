//! Queue front end: admission, waiting, stats, shutdown and supervision.

use super::handler::InferenceHandler;
use super::store::{Finish, ResultStore};
use super::task::{Task, TaskId, TaskResult};
use super::worker::{run_worker, QueueCounters, QueueShared};
use super::QueueConfig;
use crate::{Error, ErrorContext, Result};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Point-in-time queue counters. Reading them has no side effects.
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueStats {
    /// Tasks waiting for a worker.
    pub queued: usize,
    /// Tasks inside the handler right now.
    pub processing: usize,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rejected: u64,
    pub total_queued: u64,
    pub active_workers: usize,
    pub max_workers: usize,
    pub max_queue_size: usize,
    /// Results currently held in the result table.
    pub stored_results: usize,
    /// Completions per handler-reported source.
    pub by_source: HashMap<String, u64>,
}

/// Handles of the running workers plus the drained flag.
struct WorkerSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicUsize,
    drained: AtomicBool,
}

impl WorkerSet {
    fn new() -> Self {
        Self {
            handles: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
            drained: AtomicBool::new(false),
        }
    }

    fn spawn<H: InferenceHandler>(&self, shared: &Arc<QueueShared<H>>, count: usize) {
        let mut handles = self.handles.lock();
        handles.retain(|h| !h.is_finished());
        for _ in 0..count {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            handles.push(tokio::spawn(run_worker(id, shared.clone())));
        }
        self.drained.store(false, Ordering::SeqCst);
    }

    fn all_finished(&self) -> bool {
        self.handles.lock().iter().all(|h| h.is_finished())
    }

    fn take(&self) -> Vec<JoinHandle<()>> {
        std::mem::take(&mut *self.handles.lock())
    }

    /// Respawn a fully drained pool, or flag it as drained. Returns true when
    /// the pool has no live workers afterwards.
    fn supervise<H: InferenceHandler>(&self, shared: &Arc<QueueShared<H>>) -> bool {
        if shared.cancel.is_cancelled() || !self.all_finished() {
            return false;
        }
        if shared.cfg.restart_drained_workers {
            warn!(
                workers = shared.cfg.max_workers,
                "all queue workers exited, restarting worker pool"
            );
            self.spawn(shared, shared.cfg.max_workers);
            false
        } else {
            if !self.drained.swap(true, Ordering::SeqCst) {
                error!("all queue workers exited and restart is disabled");
            }
            true
        }
    }
}

/// Bounded task queue drained by a fixed-size worker pool.
///
/// Must be started inside a Tokio runtime. Dropping the queue without calling
/// [`shutdown`](Self::shutdown) signals workers to stop but does not wait.
pub struct TaskQueue<H: InferenceHandler> {
    shared: Arc<QueueShared<H>>,
    tx: mpsc::Sender<Task<H::Payload>>,
    accepting: AtomicBool,
    workers: Arc<WorkerSet>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl<H: InferenceHandler> TaskQueue<H> {
    /// Validate `cfg`, spawn `max_workers` workers and the maintenance loop.
    pub fn start(cfg: QueueConfig, handler: H) -> Result<Self> {
        cfg.validate()?;
        tokio::runtime::Handle::try_current().map_err(|e| {
            Error::runtime_with_context(
                "task queue must be started inside a Tokio runtime",
                ErrorContext::new()
                    .with_details(e.to_string())
                    .with_source("task_queue"),
            )
        })?;

        let (tx, rx) = mpsc::channel(cfg.max_queue_size);
        let shared = Arc::new(QueueShared {
            store: ResultStore::new(cfg.result_ttl),
            rx: tokio::sync::Mutex::new(rx),
            counters: QueueCounters::default(),
            cancel: CancellationToken::new(),
            handler,
            cfg,
        });

        let workers = Arc::new(WorkerSet::new());
        workers.spawn(&shared, shared.cfg.max_workers);
        let maintenance = tokio::spawn(maintenance_loop(shared.clone(), workers.clone()));

        info!(
            max_workers = shared.cfg.max_workers,
            max_queue_size = shared.cfg.max_queue_size,
            "task queue started"
        );

        Ok(Self {
            shared,
            tx,
            accepting: AtomicBool::new(true),
            workers,
            maintenance: Mutex::new(Some(maintenance)),
        })
    }

    pub fn config(&self) -> &QueueConfig {
        &self.shared.cfg
    }

    pub fn handler(&self) -> &H {
        &self.shared.handler
    }

    fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Enqueue `payload` without waiting. A full queue is rejected with
    /// `Error::QueueFull`; nothing is dropped silently.
    pub fn submit(&self, payload: H::Payload) -> Result<TaskId> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(Error::ShuttingDown);
        }
        if self.workers.supervise(&self.shared) {
            return Err(Error::WorkersDrained);
        }

        let task = Task::new(payload, self.queued());
        let task_id = task.id.clone();
        let depth = task.queue_depth;
        self.shared.store.insert_queued(task_id.clone());

        match self.tx.try_send(task) {
            Ok(()) => {
                self.shared
                    .counters
                    .total_queued
                    .fetch_add(1, Ordering::SeqCst);
                debug!(task_id = %task_id, queue_depth = depth, "task queued");
                Ok(task_id)
            }
            Err(TrySendError::Full(_)) => {
                self.shared.store.remove(&task_id);
                self.shared.counters.rejected.fetch_add(1, Ordering::SeqCst);
                warn!(
                    capacity = self.shared.cfg.max_queue_size,
                    "task queue full, rejecting submission"
                );
                Err(Error::QueueFull {
                    capacity: self.shared.cfg.max_queue_size,
                })
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.store.remove(&task_id);
                Err(Error::ShuttingDown)
            }
        }
    }

    /// Current snapshot of a task's result, without waiting.
    pub fn result(&self, task_id: &TaskId) -> TaskResult<H::Output> {
        self.shared
            .store
            .get(task_id)
            .unwrap_or_else(|| TaskResult::not_found(task_id.clone()))
    }

    /// Wait until the task reaches a terminal state or `timeout` (default
    /// `task_timeout`) passes. A timeout only affects the returned copy; the
    /// task keeps running and its result stays retrievable.
    pub async fn await_result(
        &self,
        task_id: &TaskId,
        timeout: Option<Duration>,
    ) -> TaskResult<H::Output> {
        let timeout = timeout.unwrap_or(self.shared.cfg.task_timeout);
        let poll = self.shared.cfg.poll_interval;
        // Float-to-int casts saturate, so only the slack needs guarding.
        let max_polls =
            ((timeout.as_secs_f64() / poll.as_secs_f64()).ceil() as u64).saturating_add(10);

        match tokio::time::timeout(timeout, self.poll_until_terminal(task_id, max_polls)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(task_id = %task_id, timeout_ms = timeout.as_millis() as u64, "wait for task result timed out");
                match self.shared.store.get(task_id) {
                    Some(r) if r.is_terminal() => r,
                    Some(r) => r.into_timeout("request timeout"),
                    None => TaskResult::not_found(task_id.clone()),
                }
            }
        }
    }

    async fn poll_until_terminal(&self, task_id: &TaskId, max_polls: u64) -> TaskResult<H::Output> {
        let mut last = None;
        for _ in 0..max_polls {
            match self.shared.store.get(task_id) {
                None => return TaskResult::not_found(task_id.clone()),
                Some(r) if r.is_terminal() => return r,
                Some(r) => last = Some(r),
            }
            tokio::time::sleep(self.shared.cfg.poll_interval).await;
        }
        match last {
            Some(r) => r.into_timeout("exceeded max wait time"),
            None => TaskResult::not_found(task_id.clone()),
        }
    }

    pub fn stats(&self) -> QueueStats {
        let c = &self.shared.counters;
        QueueStats {
            queued: self.queued(),
            processing: c.processing.load(Ordering::SeqCst),
            completed: c.completed.load(Ordering::SeqCst),
            failed: c.failed.load(Ordering::SeqCst),
            cancelled: c.cancelled.load(Ordering::SeqCst),
            rejected: c.rejected.load(Ordering::SeqCst),
            total_queued: c.total_queued.load(Ordering::SeqCst),
            active_workers: c.active_workers.load(Ordering::SeqCst),
            max_workers: self.shared.cfg.max_workers,
            max_queue_size: self.shared.cfg.max_queue_size,
            stored_results: self.shared.store.len(),
            by_source: c.by_source.lock().clone(),
        }
    }

    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    /// Shut down using the configured `shutdown_timeout` as grace period.
    pub async fn shutdown(&self) {
        self.shutdown_within(self.shared.cfg.shutdown_timeout).await;
    }

    /// Stop accepting, cancel workers, wait up to `grace` for them, abort
    /// stragglers and mark up to `max_cancellations` queued tasks cancelled.
    /// Calling it twice is a no-op.
    ///
    /// Entries past the cap are left untouched and keep reporting `queued`;
    /// they still count in [`QueueStats::queued`]. Raise `max_cancellations`
    /// when every queued task must reach a terminal state.
    pub async fn shutdown_within(&self, grace: Duration) {
        if !self.accepting.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(grace_ms = grace.as_millis() as u64, "task queue shutting down");
        self.shared.cancel.cancel();

        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }

        let mut handles = self.workers.take();
        let joined = tokio::time::timeout(
            grace,
            futures::future::join_all(handles.iter_mut()),
        )
        .await;
        if joined.is_err() {
            let stuck: Vec<_> = handles.into_iter().filter(|h| !h.is_finished()).collect();
            warn!(
                stuck = stuck.len(),
                grace_ms = grace.as_millis() as u64,
                "forcing worker termination"
            );
            for handle in stuck {
                handle.abort();
                let _ = handle.await;
            }
        }

        let mut rx = self.shared.rx.lock().await;
        rx.close();
        let mut cancelled = 0usize;
        while cancelled < self.shared.cfg.max_cancellations {
            let Ok(task) = rx.try_recv() else {
                break;
            };
            if self.shared.store.finish(
                &task.id,
                Finish::Cancelled {
                    reason: "queue shut down".to_string(),
                },
            ) {
                self.shared
                    .counters
                    .cancelled
                    .fetch_add(1, Ordering::SeqCst);
            }
            cancelled += 1;
        }
        let left = rx.len();
        if left > 0 {
            warn!(left, "queued tasks left unprocessed after cancellation cap");
        }
        info!(cancelled, "task queue shut down");
    }
}

impl<H: InferenceHandler> Drop for TaskQueue<H> {
    fn drop(&mut self) {
        self.shared.cancel.cancel();
    }
}

async fn maintenance_loop<H: InferenceHandler>(shared: Arc<QueueShared<H>>, workers: Arc<WorkerSet>) {
    let mut ticker = tokio::time::interval(shared.cfg.cleanup_interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = ticker.tick() => {
                let purged = shared.store.purge_expired();
                if purged > 0 {
                    info!(purged, "cleaned up expired task results");
                }
                workers.supervise(&shared);
            }
        }
    }
    debug!("queue maintenance loop stopped");
}
