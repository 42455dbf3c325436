//! 弹性模式模块：提供熔断器、令牌桶限流器和登录尝试限制器。
//!
//! # Resilience Primitives Module
//!
//! Failure containment and admission control for the service edge.
//!
//! ## Key Components
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`circuit_breaker`] | Three-state breaker around the external inference API |
//! | [`rate_limiter`] | Per-client token buckets (per minute and per hour) |
//! | [`login_limiter`] | Rolling-window lockout for authentication endpoints |
//!
//! ## Circuit Breaker
//!
//! - **Closed**: Normal operation, calls pass through
//! - **Open**: Failures reached the threshold, calls fail fast
//! - **Half-Open**: One trial call decides whether to close or reopen
//!
//! ```rust
//! use ai_governor::resilience::circuit_breaker::{BreakerError, CircuitBreaker, CircuitBreakerConfig};
//! use std::time::Duration;
//!
//! let breaker = CircuitBreaker::new(
//!     CircuitBreakerConfig::new()
//!         .with_failure_threshold(5)
//!         .with_recovery_timeout(Duration::from_secs(30)),
//! );
//!
//! let answer: Result<u32, BreakerError<std::io::Error>> = breaker.call(|| Ok(42));
//! assert_eq!(answer.unwrap(), 42);
//! ```
//!
//! ## Rate Limiter
//!
//! ```rust
//! use ai_governor::resilience::rate_limiter::{ClientRateLimiter, RateLimitConfig};
//!
//! let limiter = ClientRateLimiter::new(RateLimitConfig::new().with_per_minute(30));
//! if let Err(err) = limiter.check("203.0.113.7") {
//!     // Reply 429 with err.retry_after()
//!     let _ = err.retry_after();
//! }
//! ```

pub mod circuit_breaker;
pub mod login_limiter;
pub mod rate_limiter;
