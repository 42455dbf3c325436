//! Connection factory seam and the scoped connection guard.

use super::manager::PoolInner;
use crate::Result;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Creates, checks and closes raw database connections.
///
/// Driver and DSN details live behind this trait; the pool only sees opaque
/// connections.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a new connection, giving up after `timeout`.
    fn connect(&self, timeout: Duration) -> Result<Self::Connection>;

    /// Cheap liveness round-trip, e.g. `SELECT 1`.
    fn is_valid(&self, conn: &mut Self::Connection) -> bool;

    fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// A live connection plus its creation time.
pub(crate) struct Pooled<C> {
    pub(crate) conn: C,
    pub(crate) created_at: Instant,
}

impl<C> Pooled<C> {
    pub(crate) fn new(conn: C) -> Self {
        Self {
            conn,
            created_at: Instant::now(),
        }
    }

    pub(crate) fn is_expired(&self, max_lifetime: Duration) -> bool {
        self.created_at.elapsed() >= max_lifetime
    }
}

/// Exclusive loan of one pooled connection.
///
/// Returned to the pool when dropped, on every exit path including panics.
pub struct PooledConnection<F: ConnectionFactory> {
    pool: Arc<PoolInner<F>>,
    inner: Option<Pooled<F::Connection>>,
    broken: bool,
}

impl<F: ConnectionFactory> PooledConnection<F> {
    pub(crate) fn new(pool: Arc<PoolInner<F>>, inner: Pooled<F::Connection>) -> Self {
        Self {
            pool,
            inner: Some(inner),
            broken: false,
        }
    }

    /// Mark the connection as broken so it is closed instead of reused.
    pub fn discard(&mut self) {
        self.broken = true;
    }

    /// Time since the underlying connection was opened.
    pub fn age(&self) -> Duration {
        self.inner
            .as_ref()
            .map(|p| p.created_at.elapsed())
            .unwrap_or_default()
    }
}

impl<F: ConnectionFactory> Deref for PooledConnection<F> {
    type Target = F::Connection;

    fn deref(&self) -> &Self::Target {
        match &self.inner {
            Some(p) => &p.conn,
            None => unreachable!("connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> DerefMut for PooledConnection<F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.inner {
            Some(p) => &mut p.conn,
            None => unreachable!("connection accessed after release"),
        }
    }
}

impl<F: ConnectionFactory> Drop for PooledConnection<F> {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            let broken = self.broken || std::thread::panicking();
            self.pool.release(inner, broken);
        }
    }
}

impl<F: ConnectionFactory> fmt::Debug for PooledConnection<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("age", &self.age())
            .field("broken", &self.broken)
            .finish()
    }
}
