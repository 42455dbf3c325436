//! Worker loop and the state it shares with the queue front end.

use super::handler::InferenceHandler;
use super::store::{Finish, ResultStore};
use super::task::Task;
use super::QueueConfig;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Default)]
pub(crate) struct QueueCounters {
    pub(crate) total_queued: AtomicU64,
    pub(crate) completed: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
    pub(crate) rejected: AtomicU64,
    pub(crate) processing: AtomicUsize,
    pub(crate) active_workers: AtomicUsize,
    pub(crate) by_source: Mutex<HashMap<String, u64>>,
}

impl QueueCounters {
    fn record_source(&self, source: Option<&str>) {
        let key = source.unwrap_or("unknown");
        *self.by_source.lock().entry(key.to_string()).or_insert(0) += 1;
    }
}

pub(crate) struct QueueShared<H: InferenceHandler> {
    pub(crate) cfg: QueueConfig,
    pub(crate) handler: H,
    pub(crate) rx: tokio::sync::Mutex<mpsc::Receiver<Task<H::Payload>>>,
    pub(crate) store: ResultStore<H::Output>,
    pub(crate) counters: QueueCounters,
    pub(crate) cancel: CancellationToken,
}

/// Keeps `active_workers` honest on every exit path, including abort.
struct ActiveGuard<'a>(&'a AtomicUsize);

impl<'a> ActiveGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ActiveGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counts tasks currently inside the handler.
struct ProcessingGuard<'a>(&'a AtomicUsize);

impl<'a> ProcessingGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for ProcessingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

enum Step {
    Completed,
    Failed,
    Internal,
    Cancelled,
}

/// Run one worker until shutdown, channel close, or too many internal errors.
pub(crate) async fn run_worker<H: InferenceHandler>(worker_id: usize, shared: Arc<QueueShared<H>>) {
    let _active = ActiveGuard::enter(&shared.counters.active_workers);
    info!(worker_id, "queue worker started");

    let mut consecutive_failures: u32 = 0;
    let mut consecutive_errors: u32 = 0;

    loop {
        let next = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            task = async { shared.rx.lock().await.recv().await } => task,
        };
        let Some(task) = next else {
            debug!(worker_id, "task channel closed");
            break;
        };

        match process(worker_id, &shared, task).await {
            Step::Completed => {
                consecutive_failures = 0;
                consecutive_errors = 0;
            }
            Step::Failed => {
                consecutive_failures += 1;
                consecutive_errors = 0;
                if let Some(delay) = shared.cfg.backoff_for(consecutive_failures) {
                    warn!(
                        worker_id,
                        consecutive_failures,
                        backoff_ms = delay.as_millis() as u64,
                        "worker backing off after repeated task failures"
                    );
                    tokio::select! {
                        _ = shared.cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
            Step::Internal => {
                consecutive_errors += 1;
                if consecutive_errors >= shared.cfg.max_consecutive_errors {
                    error!(
                        worker_id,
                        consecutive_errors, "worker terminating after repeated internal errors"
                    );
                    break;
                }
                let delay = shared
                    .cfg
                    .backoff_step
                    .saturating_mul(consecutive_errors)
                    .min(shared.cfg.max_backoff);
                tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            Step::Cancelled => break,
        }
    }

    info!(worker_id, "queue worker stopped");
}

async fn process<H: InferenceHandler>(
    worker_id: usize,
    shared: &QueueShared<H>,
    task: Task<H::Payload>,
) -> Step {
    let started = Instant::now();
    let task_id = task.id.clone();
    debug!(worker_id, task_id = %task_id, queue_depth = task.queue_depth, "processing task");

    let outcome = {
        let _processing = ProcessingGuard::enter(&shared.counters.processing);
        let work = AssertUnwindSafe(shared.handler.handle(&task)).catch_unwind();
        tokio::select! {
            _ = shared.cancel.cancelled() => None,
            out = work => Some(out),
        }
    };

    let counters = &shared.counters;
    match outcome {
        None => {
            if shared.store.finish(
                &task_id,
                Finish::Cancelled {
                    reason: "cancelled during shutdown".to_string(),
                },
            ) {
                counters.cancelled.fetch_add(1, Ordering::SeqCst);
            }
            info!(worker_id, task_id = %task_id, "task cancelled while processing");
            Step::Cancelled
        }
        Some(Ok(Ok(output))) => {
            let source = shared.handler.source_of(&output);
            counters.record_source(source.as_deref());
            if shared
                .store
                .finish(&task_id, Finish::Completed { output, source })
            {
                counters.completed.fetch_add(1, Ordering::SeqCst);
            }
            debug!(
                worker_id,
                task_id = %task_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "task completed"
            );
            Step::Completed
        }
        Some(Ok(Err(err))) => {
            warn!(worker_id, task_id = %task_id, error = %err, "task failed");
            if shared.store.finish(
                &task_id,
                Finish::Failed {
                    error: err.to_string(),
                },
            ) {
                counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            Step::Failed
        }
        Some(Err(_panic)) => {
            error!(worker_id, task_id = %task_id, "handler panicked");
            if shared.store.finish(
                &task_id,
                Finish::Failed {
                    error: "internal worker error".to_string(),
                },
            ) {
                counters.failed.fetch_add(1, Ordering::SeqCst);
            }
            Step::Internal
        }
    }
}
