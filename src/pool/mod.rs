//! 连接池模块：固定基础连接加有界溢出，带健康检查与最大生命周期回收。
//!
//! # Connection Pool Module
//!
//! Amortizes connection setup while bounding the number of concurrent
//! database connections.
//!
//! ## Overview
//!
//! - `pool_size` connections are opened eagerly, up to `max_overflow` more on
//!   demand
//! - Every hand-out is validated: lifetime first, then a liveness round-trip
//! - [`PooledConnection`] returns itself on drop, on every exit path
//! - Exhaustion fails fast after a bounded number of short waits
//!
//! ## Example
//!
//! ```rust
//! use ai_governor::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
//! use std::time::Duration;
//!
//! struct Loopback;
//!
//! impl ConnectionFactory for Loopback {
//!     type Connection = Vec<String>;
//!
//!     fn connect(&self, _timeout: Duration) -> ai_governor::Result<Self::Connection> {
//!         Ok(Vec::new())
//!     }
//!
//!     fn is_valid(&self, _conn: &mut Self::Connection) -> bool {
//!         true
//!     }
//! }
//!
//! let pool = ConnectionPool::new(PoolConfig::new().with_pool_size(2), Loopback);
//! {
//!     let mut conn = pool.acquire()?;
//!     conn.push("INSERT ...".to_string());
//! }
//! assert_eq!(pool.stats().available, 2);
//! # Ok::<(), ai_governor::Error>(())
//! ```

pub mod connection;
pub mod dsn;
pub(crate) mod idle;
pub mod manager;

pub use connection::{ConnectionFactory, PooledConnection};
pub use dsn::mask_dsn;
pub use manager::{ConnectionPool, PoolConfig, PoolStats};
