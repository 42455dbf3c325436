//! Composition root: one instance of every primitive, built from one config.

use crate::config::GovernorConfig;
use crate::pool::{ConnectionFactory, ConnectionPool, PoolStats};
use crate::queue::{BreakerHandler, InferenceHandler, QueueStats, TaskQueue};
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerStatus};
use crate::resilience::login_limiter::LoginRateLimiter;
use crate::resilience::rate_limiter::{ClientRateLimiter, RateLimits};
use crate::Result;
use serde::Serialize;
use std::sync::Arc;
use tracing::info;

/// Combined health view for a status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct GovernorStatus {
    pub queue: QueueStats,
    pub pool: PoolStats,
    pub breaker: CircuitBreakerStatus,
    pub rate_limits: RateLimits,
    pub tracked_clients: usize,
}

/// Owns the rate limiters, the breaker, the task queue and the connection
/// pool of one service instance. Share it behind an `Arc`.
pub struct Governor<H: InferenceHandler, F: ConnectionFactory> {
    config: GovernorConfig,
    rate_limiter: ClientRateLimiter,
    login_limiter: LoginRateLimiter,
    breaker: Arc<CircuitBreaker>,
    queue: TaskQueue<BreakerHandler<H>>,
    pool: ConnectionPool<F>,
}

impl<H: InferenceHandler, F: ConnectionFactory> Governor<H, F> {
    /// Validate `config` and start every component. The inference handler
    /// is wrapped by the circuit breaker before the queue sees it.
    pub fn start(config: GovernorConfig, handler: H, factory: F) -> Result<Self> {
        let config = config.validate()?;

        let breaker = Arc::new(CircuitBreaker::new(config.breaker.clone()));
        let queue = TaskQueue::start(
            config.queue.clone(),
            BreakerHandler::new(handler, breaker.clone()),
        )?;
        let pool = ConnectionPool::new(config.pool.clone(), factory);
        let rate_limiter = ClientRateLimiter::new(config.rate_limit.clone());
        let login_limiter = LoginRateLimiter::new(config.login.clone());

        info!(breaker = %config.breaker.name, "governor started");
        Ok(Self {
            config,
            rate_limiter,
            login_limiter,
            breaker,
            queue,
            pool,
        })
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.config
    }

    /// Rate-limit gate for an inbound request from `identity`.
    pub fn admit(&self, identity: &str) -> Result<()> {
        self.rate_limiter.check(identity)
    }

    pub fn rate_limiter(&self) -> &ClientRateLimiter {
        &self.rate_limiter
    }

    pub fn login_limiter(&self) -> &LoginRateLimiter {
        &self.login_limiter
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn queue(&self) -> &TaskQueue<BreakerHandler<H>> {
        &self.queue
    }

    pub fn pool(&self) -> &ConnectionPool<F> {
        &self.pool
    }

    pub fn status(&self) -> GovernorStatus {
        GovernorStatus {
            queue: self.queue.stats(),
            pool: self.pool.stats(),
            breaker: self.breaker.status(),
            rate_limits: self.rate_limiter.limits(),
            tracked_clients: self.rate_limiter.bucket_count(),
        }
    }

    /// Drain the queue, then close the pool.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
        self.pool.close_all();
        info!("governor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{FnHandler, Task, TaskStatus};
    use crate::Error;
    use std::time::Duration;

    struct NullFactory;

    impl ConnectionFactory for NullFactory {
        type Connection = ();

        fn connect(&self, _timeout: Duration) -> Result<()> {
            Ok(())
        }

        fn is_valid(&self, _conn: &mut ()) -> bool {
            true
        }
    }

    fn config() -> GovernorConfig {
        let mut cfg = GovernorConfig::default();
        cfg.rate_limit.requests_per_minute = 2;
        cfg.pool.pool_size = 2;
        cfg.pool.max_overflow = 0;
        cfg.breaker.failure_threshold = 1;
        cfg
    }

    #[tokio::test]
    async fn test_start_admit_and_shutdown() {
        let handler = FnHandler::new(|t: Task<String>| async move { Ok::<_, Error>(t.payload.len()) });
        let gov = Governor::start(config(), handler, NullFactory).unwrap();

        assert!(gov.admit("10.0.0.1").is_ok());
        assert!(gov.admit("10.0.0.1").is_ok());
        let err = gov.admit("10.0.0.1").unwrap_err();
        assert!(matches!(err, Error::RateLimited { window: "minute", .. }));
        assert!(gov.admit("10.0.0.2").is_ok());

        let id = gov.queue().submit("four".to_string()).unwrap();
        let r = gov.queue().await_result(&id, Some(Duration::from_secs(5))).await;
        assert_eq!(r.status, TaskStatus::Completed);
        assert_eq!(r.output, Some(4));

        let status = gov.status();
        assert_eq!(status.pool.pool_size, 2);
        assert_eq!(status.rate_limits.per_minute, 2);
        assert_eq!(status.tracked_clients, 2);

        gov.shutdown().await;
        assert!(gov.pool().is_closed());
        assert!(matches!(gov.queue().submit("x".into()), Err(Error::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_failing_handler_trips_shared_breaker() {
        let handler = FnHandler::new(|_t: Task<u8>| async move {
            Err::<u8, _>(Error::runtime_with_context(
                "upstream 502",
                crate::ErrorContext::new().with_source("test"),
            ))
        });
        let gov = Governor::start(config(), handler, NullFactory).unwrap();

        let first = gov.queue().submit(1).unwrap();
        let r = gov.queue().await_result(&first, Some(Duration::from_secs(5))).await;
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(gov.breaker().status().open_remaining_ms.is_some());

        let second = gov.queue().submit(2).unwrap();
        let r = gov.queue().await_result(&second, Some(Duration::from_secs(5))).await;
        assert_eq!(r.status, TaskStatus::Failed);
        assert!(r.error.unwrap().contains("is open"));
        gov.shutdown().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let handler = FnHandler::new(|t: Task<u8>| async move { Ok::<_, Error>(t.payload) });
        let mut cfg = GovernorConfig::default();
        cfg.queue.max_workers = 0;
        assert!(Governor::start(cfg, handler, NullFactory).is_err());
    }
}
