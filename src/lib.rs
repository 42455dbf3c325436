//! # ai-governor
//!
//! 面向推理服务后端的并发与资源治理层：任务队列、连接池、限流与熔断。
//!
//! Concurrency and resource governance for web backends that front a
//! third-party inference API and a SQL datastore.
//!
//! ## Overview
//!
//! Four primitives sit between request handlers and their dependencies:
//!
//! - **Rate limiting**: per-client token buckets and a login-attempt lockout,
//!   checked before any work is accepted
//! - **Task queue**: a bounded queue drained by a small worker pool, so
//!   inference load stays bounded no matter how many requests arrive
//! - **Circuit breaker**: fails fast while the inference API is degraded
//! - **Connection pool**: a fixed set of database connections plus bounded
//!   overflow, validated and retired by age
//!
//! Capacity problems (full queue, exhausted pool, rate limit, open breaker)
//! come back as typed [`Error`] values carrying a retry hint. They are
//! backpressure signals, never reasons to crash.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_governor::config::GovernorConfig;
//! use ai_governor::governor::Governor;
//! use ai_governor::pool::ConnectionFactory;
//! use ai_governor::queue::{FnHandler, Task};
//! use std::time::Duration;
//!
//! struct Db;
//!
//! impl ConnectionFactory for Db {
//!     type Connection = ();
//!     fn connect(&self, _timeout: Duration) -> ai_governor::Result<()> {
//!         Ok(())
//!     }
//!     fn is_valid(&self, _conn: &mut ()) -> bool {
//!         true
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> ai_governor::Result<()> {
//!     let handler = FnHandler::new(|task: Task<String>| async move {
//!         Ok::<_, ai_governor::Error>(format!("answer to {}", task.payload))
//!     });
//!     let governor = Governor::start(GovernorConfig::load("governor.yaml")?, handler, Db)?;
//!
//!     governor.admit("198.51.100.4")?;
//!     let id = governor.queue().submit("hello".to_string())?;
//!     let result = governor.queue().await_result(&id, None).await;
//!     println!("{}: {:?}", result.status, result.output);
//!
//!     governor.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`queue`] | Bounded task queue and worker pool |
//! | [`pool`] | Database connection pool |
//! | [`resilience`] | Circuit breaker, token-bucket and login limiters |
//! | [`config`] | Aggregate configuration with file and env loading |
//! | [`governor`] | Composition root owning one of each primitive |
//! | [`error_code`] | Stable error codes and boundary hints |
//! | [`logging`] | Tracing subscriber setup |

pub mod config;
pub mod error_code;
pub mod governor;
pub mod logging;
pub mod pool;
pub mod queue;
pub mod resilience;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
