//! 任务队列模块：有界异步队列与工作者池，串行化并限流对推理服务的调用。
//!
//! # Task Queue Module
//!
//! Decouples request latency from inference latency. Requests submit work
//! and wait on a result; a small fixed set of workers drains the queue and
//! calls the [`InferenceHandler`].
//!
//! ## Overview
//!
//! - **Bounded admission**: [`TaskQueue::submit`] never blocks; a full queue
//!   is reported as `Error::QueueFull`
//! - **Result table**: every accepted task gets a `queued` result that moves
//!   forward exactly once to `completed`, `failed` or `cancelled`
//! - **Caller-side timeouts**: [`TaskQueue::await_result`] gives up with a
//!   `timeout` copy, the task keeps running and stays retrievable
//! - **Worker hygiene**: backoff after repeated task failures, self-termination
//!   after repeated internal errors, supervision by the maintenance loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use ai_governor::queue::{FnHandler, QueueConfig, Task, TaskQueue, TaskStatus};
//!
//! # async fn run() -> ai_governor::Result<()> {
//! let handler = FnHandler::new(|task: Task<String>| async move {
//!     Ok::<_, ai_governor::Error>(format!("echo: {}", task.payload))
//! });
//! let queue = TaskQueue::start(QueueConfig::new().with_max_workers(2), handler)?;
//!
//! let id = queue.submit("hello".to_string())?;
//! let result = queue.await_result(&id, None).await;
//! assert_eq!(result.status, TaskStatus::Completed);
//!
//! queue.shutdown().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{duration_secs, require_nonzero, require_positive};
use crate::Result;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod handler;
pub mod service;
pub(crate) mod store;
pub mod task;
pub(crate) mod worker;

pub use handler::{BreakerHandler, FnHandler, InferenceHandler};
pub use service::{QueueStats, TaskQueue};
pub use task::{Task, TaskId, TaskResult, TaskStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub max_workers: usize,
    pub max_queue_size: usize,
    /// Default wait used by `await_result` when the caller passes none.
    #[serde(with = "duration_secs")]
    pub task_timeout: Duration,
    /// How long finished results stay retrievable.
    #[serde(with = "duration_secs")]
    pub result_ttl: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    #[serde(with = "duration_secs")]
    pub poll_interval: Duration,
    /// Consecutive task failures before a worker starts backing off.
    pub failure_backoff_threshold: u32,
    /// Consecutive internal errors after which a worker exits.
    pub max_consecutive_errors: u32,
    #[serde(with = "duration_secs")]
    pub backoff_step: Duration,
    #[serde(with = "duration_secs")]
    pub max_backoff: Duration,
    /// Upper bound on queued entries marked cancelled during shutdown.
    pub max_cancellations: usize,
    #[serde(with = "duration_secs")]
    pub shutdown_timeout: Duration,
    pub restart_drained_workers: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 2,
            max_queue_size: 50,
            task_timeout: Duration::from_secs(60),
            result_ttl: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(60),
            poll_interval: Duration::from_millis(200),
            failure_backoff_threshold: 3,
            max_consecutive_errors: 5,
            backoff_step: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            max_cancellations: 100,
            shutdown_timeout: Duration::from_secs(5),
            restart_drained_workers: true,
        }
    }
}

impl QueueConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.max_workers = n;
        self
    }

    pub fn with_max_queue_size(mut self, n: usize) -> Self {
        self.max_queue_size = n;
        self
    }

    pub fn with_task_timeout(mut self, d: Duration) -> Self {
        self.task_timeout = d;
        self
    }

    pub fn with_result_ttl(mut self, d: Duration) -> Self {
        self.result_ttl = d;
        self
    }

    pub fn with_cleanup_interval(mut self, d: Duration) -> Self {
        self.cleanup_interval = d;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval = d;
        self
    }

    pub fn with_failure_backoff(mut self, threshold: u32, step: Duration, max: Duration) -> Self {
        self.failure_backoff_threshold = threshold;
        self.backoff_step = step;
        self.max_backoff = max;
        self
    }

    pub fn with_max_consecutive_errors(mut self, n: u32) -> Self {
        self.max_consecutive_errors = n;
        self
    }

    pub fn with_max_cancellations(mut self, n: usize) -> Self {
        self.max_cancellations = n;
        self
    }

    pub fn with_shutdown_timeout(mut self, d: Duration) -> Self {
        self.shutdown_timeout = d;
        self
    }

    pub fn with_restart_drained_workers(mut self, restart: bool) -> Self {
        self.restart_drained_workers = restart;
        self
    }

    pub fn validate(&self) -> Result<()> {
        require_nonzero(self.max_workers as u64, "queue.max_workers")?;
        require_nonzero(self.max_queue_size as u64, "queue.max_queue_size")?;
        require_nonzero(self.max_consecutive_errors as u64, "queue.max_consecutive_errors")?;
        require_positive(self.task_timeout, "queue.task_timeout")?;
        require_positive(self.result_ttl, "queue.result_ttl")?;
        require_positive(self.cleanup_interval, "queue.cleanup_interval")?;
        require_positive(self.poll_interval, "queue.poll_interval")?;
        Ok(())
    }

    /// Backoff before the next task after `failures` consecutive task failures.
    pub fn backoff_for(&self, failures: u32) -> Option<Duration> {
        if self.failure_backoff_threshold == 0 || failures < self.failure_backoff_threshold {
            return None;
        }
        Some(self.backoff_step.saturating_mul(failures).min(self.max_backoff))
    }
}
