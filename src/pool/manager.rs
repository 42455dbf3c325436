//! Connection pool: a fixed base set plus bounded overflow.

use super::connection::{ConnectionFactory, Pooled, PooledConnection};
use super::dsn::mask_dsn;
use super::idle::IdleQueue;
use crate::config::duration_secs;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const POOL_SIZE_RANGE: (usize, usize) = (1, 50);
const OVERFLOW_RANGE: (usize, usize) = (0, 50);
const CONNECT_TIMEOUT_RANGE: (Duration, Duration) =
    (Duration::from_secs(5), Duration::from_secs(300));

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Connections opened eagerly and kept idle.
    pub pool_size: usize,
    /// Extra connections allowed on demand above `pool_size`.
    pub max_overflow: usize,
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
    /// Connections older than this are retired even when healthy.
    #[serde(with = "duration_secs")]
    pub max_lifetime: Duration,
    /// How long one acquire attempt waits for a connection to come back.
    #[serde(with = "duration_secs")]
    pub checkout_wait: Duration,
    /// Retries after the first attempt before reporting exhaustion.
    pub acquire_retries: u32,
    #[serde(with = "duration_secs")]
    pub retry_backoff: Duration,
    #[serde(with = "duration_secs")]
    pub max_retry_backoff: Duration,
    pub validate_on_release: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 10,
            max_overflow: 20,
            connect_timeout: Duration::from_secs(30),
            max_lifetime: Duration::from_secs(3600),
            checkout_wait: Duration::from_millis(100),
            acquire_retries: 2,
            retry_backoff: Duration::from_millis(50),
            max_retry_backoff: Duration::from_secs(3),
            validate_on_release: true,
        }
    }
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_pool_size(mut self, n: usize) -> Self {
        self.pool_size = n;
        self
    }

    pub fn with_max_overflow(mut self, n: usize) -> Self {
        self.max_overflow = n;
        self
    }

    pub fn with_connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    pub fn with_max_lifetime(mut self, d: Duration) -> Self {
        self.max_lifetime = d;
        self
    }

    pub fn with_checkout_wait(mut self, d: Duration) -> Self {
        self.checkout_wait = d;
        self
    }

    pub fn with_acquire_retries(mut self, n: u32) -> Self {
        self.acquire_retries = n;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff = base;
        self.max_retry_backoff = max;
        self
    }

    pub fn with_validate_on_release(mut self, validate: bool) -> Self {
        self.validate_on_release = validate;
        self
    }

    /// Clamp sizes and timeout into their supported ranges.
    pub fn normalized(mut self) -> Self {
        let pool_size = self.pool_size.clamp(POOL_SIZE_RANGE.0, POOL_SIZE_RANGE.1);
        let max_overflow = self.max_overflow.clamp(OVERFLOW_RANGE.0, OVERFLOW_RANGE.1);
        let connect_timeout = self
            .connect_timeout
            .clamp(CONNECT_TIMEOUT_RANGE.0, CONNECT_TIMEOUT_RANGE.1);
        if pool_size != self.pool_size
            || max_overflow != self.max_overflow
            || connect_timeout != self.connect_timeout
        {
            warn!(
                requested_pool_size = self.pool_size,
                pool_size,
                requested_max_overflow = self.max_overflow,
                max_overflow,
                connect_timeout_secs = connect_timeout.as_secs(),
                "pool configuration clamped to supported range"
            );
        }
        self.pool_size = pool_size;
        self.max_overflow = max_overflow;
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn max_connections(&self) -> usize {
        self.pool_size + self.max_overflow
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_backoff
            .saturating_mul(factor)
            .min(self.max_retry_backoff)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    /// Live connections, idle or lent out.
    pub current_size: usize,
    /// Connections lent out right now.
    pub active: usize,
    /// Idle connections ready for hand-off.
    pub available: usize,
    pub max_overflow: usize,
    pub created: u64,
    pub destroyed: u64,
    pub exhausted: u64,
}

#[derive(Debug, Default)]
struct Bookkeeping {
    live: usize,
    closed: bool,
}

pub(crate) struct PoolInner<F: ConnectionFactory> {
    cfg: PoolConfig,
    factory: F,
    label: String,
    idle: IdleQueue<Pooled<F::Connection>>,
    book: Mutex<Bookkeeping>,
    created: AtomicU64,
    destroyed: AtomicU64,
    exhausted: AtomicU64,
}

impl<F: ConnectionFactory> PoolInner<F> {
    /// Claim a slot for a new connection if below the cap.
    fn reserve_slot(&self) -> std::result::Result<(), Error> {
        let mut book = self.book.lock();
        if book.closed {
            return Err(Error::ShuttingDown);
        }
        if book.live >= self.cfg.max_connections() {
            return Err(Error::PoolExhausted {
                attempts: 0,
                waited: Duration::ZERO,
            });
        }
        book.live += 1;
        Ok(())
    }

    fn free_slot(&self) {
        let mut book = self.book.lock();
        book.live = book.live.saturating_sub(1);
        drop(book);
        self.idle.notify();
    }

    /// Open a connection into an already reserved slot.
    fn open(&self) -> Result<Pooled<F::Connection>> {
        match self.factory.connect(self.cfg.connect_timeout) {
            Ok(conn) => {
                self.created.fetch_add(1, Ordering::Relaxed);
                debug!(target_db = %self.label, "opened database connection");
                Ok(Pooled::new(conn))
            }
            Err(err) => {
                self.free_slot();
                let message = match err {
                    Error::ConnectionCreate { message } => mask_dsn(&message),
                    other => mask_dsn(&other.to_string()),
                };
                error!(target_db = %self.label, error = %message, "failed to create connection");
                Err(Error::ConnectionCreate { message })
            }
        }
    }

    fn destroy(&self, pooled: Pooled<F::Connection>) {
        self.factory.close(pooled.conn);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        self.free_slot();
    }

    /// Lifetime first, then the liveness round-trip.
    fn validate(&self, pooled: &mut Pooled<F::Connection>) -> bool {
        if pooled.is_expired(self.cfg.max_lifetime) {
            debug!(
                age_secs = pooled.created_at.elapsed().as_secs(),
                "retiring connection past max lifetime"
            );
            return false;
        }
        if !self.factory.is_valid(&mut pooled.conn) {
            warn!(target_db = %self.label, "connection failed validation");
            return false;
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.book.lock().closed
    }

    pub(crate) fn release(&self, mut pooled: Pooled<F::Connection>, broken: bool) {
        if broken || self.is_closed() {
            self.destroy(pooled);
            return;
        }
        if self.cfg.validate_on_release && !self.validate(&mut pooled) {
            self.destroy(pooled);
            return;
        }
        // Re-check under the book lock: `close_all` may have run during the
        // liveness round-trip, and its drain must not miss this connection.
        let parked = {
            let book = self.book.lock();
            if book.closed {
                Err(pooled)
            } else {
                self.idle.push(pooled)
            }
        };
        if let Err(pooled) = parked {
            debug!("pool closed or idle set full, closing returned connection");
            self.destroy(pooled);
        }
    }

    /// Take a healthy idle connection, destroying stale ones on the way.
    fn take_idle(&self, first: Option<Pooled<F::Connection>>) -> Option<Pooled<F::Connection>> {
        let mut candidate = first.or_else(|| self.idle.try_pop());
        while let Some(mut pooled) = candidate {
            if self.validate(&mut pooled) {
                return Some(pooled);
            }
            self.destroy(pooled);
            candidate = self.idle.try_pop();
        }
        None
    }
}

/// Thread-safe pool of database connections.
///
/// Cloning is cheap and every clone shares the same connections.
pub struct ConnectionPool<F: ConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ConnectionFactory> Clone for ConnectionPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<F: ConnectionFactory> ConnectionPool<F> {
    /// Build the pool and eagerly open `pool_size` connections. Failures
    /// during warm-up are logged; the pool retries lazily on acquire.
    pub fn new(cfg: PoolConfig, factory: F) -> Self {
        Self::with_label(cfg, factory, "database")
    }

    /// Like [`new`](Self::new) with a label for logs. The label is masked
    /// before use, so a raw DSN is acceptable.
    pub fn with_label(cfg: PoolConfig, factory: F, label: &str) -> Self {
        let cfg = cfg.normalized();
        let inner = Arc::new(PoolInner {
            idle: IdleQueue::new(cfg.pool_size),
            label: mask_dsn(label),
            book: Mutex::new(Bookkeeping::default()),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            factory,
            cfg,
        });

        let target = inner.cfg.pool_size;
        let mut opened = 0;
        for _ in 0..target {
            if inner.reserve_slot().is_err() {
                break;
            }
            match inner.open() {
                Ok(pooled) => {
                    if let Err(pooled) = inner.idle.push(pooled) {
                        inner.destroy(pooled);
                    } else {
                        opened += 1;
                    }
                }
                Err(_) => continue,
            }
        }
        if opened == 0 {
            error!(target_db = %inner.label, "connection pool started without any connection");
        } else {
            info!(
                target_db = %inner.label,
                opened,
                pool_size = inner.cfg.pool_size,
                max_overflow = inner.cfg.max_overflow,
                "connection pool initialized"
            );
        }
        Self { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.cfg
    }

    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Borrow a validated connection.
    ///
    /// Tries the idle set, then a new connection below the cap, then waits
    /// `checkout_wait` for a release. Repeats with exponential backoff up to
    /// `acquire_retries` times before returning `Error::PoolExhausted`.
    /// A failing factory surfaces as `Error::ConnectionCreate`.
    pub fn acquire(&self) -> Result<PooledConnection<F>> {
        let inner = &self.inner;
        let started = Instant::now();
        let attempts = inner.cfg.acquire_retries.saturating_add(1);
        let mut create_error = None;

        for attempt in 0..attempts {
            if inner.is_closed() {
                return Err(Error::ShuttingDown);
            }

            if let Some(pooled) = inner.take_idle(None) {
                return Ok(PooledConnection::new(inner.clone(), pooled));
            }

            match inner.reserve_slot() {
                Ok(()) => match inner.open() {
                    Ok(pooled) => {
                        debug!(attempt, "handing out new connection");
                        return Ok(PooledConnection::new(inner.clone(), pooled));
                    }
                    Err(err) => create_error = Some(err),
                },
                Err(Error::ShuttingDown) => return Err(Error::ShuttingDown),
                Err(_) => {
                    let waited = inner.idle.pop_timeout(inner.cfg.checkout_wait);
                    if let Some(pooled) = inner.take_idle(waited) {
                        return Ok(PooledConnection::new(inner.clone(), pooled));
                    }
                }
            }

            if attempt + 1 < attempts {
                std::thread::sleep(inner.cfg.backoff(attempt));
            }
        }

        if let Some(err) = create_error {
            return Err(err);
        }
        inner.exhausted.fetch_add(1, Ordering::Relaxed);
        let waited = started.elapsed();
        warn!(
            attempts,
            waited_ms = waited.as_millis() as u64,
            max_connections = inner.cfg.max_connections(),
            "connection pool exhausted"
        );
        Err(Error::PoolExhausted { attempts, waited })
    }

    /// Give a connection back early. Same as dropping it.
    pub fn release(&self, conn: PooledConnection<F>) {
        drop(conn);
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let live = inner.book.lock().live;
        let available = inner.idle.len();
        PoolStats {
            pool_size: inner.cfg.pool_size,
            current_size: live,
            active: live.saturating_sub(available),
            available,
            max_overflow: inner.cfg.max_overflow,
            created: inner.created.load(Ordering::Relaxed),
            destroyed: inner.destroyed.load(Ordering::Relaxed),
            exhausted: inner.exhausted.load(Ordering::Relaxed),
        }
    }

    /// Close every idle connection and refuse new acquires. Connections still
    /// lent out are closed when they come back.
    pub fn close_all(&self) {
        let inner = &self.inner;
        inner.book.lock().closed = true;
        let idle = inner.idle.drain();
        let closed = idle.len();
        for pooled in idle {
            inner.destroy(pooled);
        }
        let active = inner.book.lock().live;
        if active > 0 {
            warn!(active, "closing pool while connections are still lent out");
        }
        info!(closed, "connection pool closed");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};

    #[derive(Debug)]
    struct FakeConn {
        id: u32,
        healthy: Arc<AtomicBool>,
    }

    #[derive(Default)]
    struct FakeFactory {
        next: AtomicU32,
        fail: AtomicBool,
        healthy: Arc<AtomicBool>,
        closed: AtomicU32,
        validate_delay_ms: AtomicU64,
    }

    impl FakeFactory {
        fn healthy() -> Self {
            let f = Self::default();
            f.healthy.store(true, Ordering::SeqCst);
            f
        }
    }

    impl ConnectionFactory for FakeFactory {
        type Connection = FakeConn;

        fn connect(&self, _timeout: Duration) -> Result<FakeConn> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::ConnectionCreate {
                    message: "login failed for PWD=secret".into(),
                });
            }
            Ok(FakeConn {
                id: self.next.fetch_add(1, Ordering::SeqCst),
                healthy: self.healthy.clone(),
            })
        }

        fn is_valid(&self, conn: &mut FakeConn) -> bool {
            let delay = self.validate_delay_ms.load(Ordering::SeqCst);
            if delay > 0 {
                std::thread::sleep(Duration::from_millis(delay));
            }
            conn.healthy.load(Ordering::SeqCst)
        }

        fn close(&self, _conn: FakeConn) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quick(pool_size: usize, overflow: usize) -> PoolConfig {
        PoolConfig::new()
            .with_pool_size(pool_size)
            .with_max_overflow(overflow)
            .with_checkout_wait(Duration::from_millis(5))
            .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(4))
    }

    #[test]
    fn test_eager_initialization() {
        let pool = ConnectionPool::new(quick(3, 2), FakeFactory::healthy());
        let s = pool.stats();
        assert_eq!(s.current_size, 3);
        assert_eq!(s.available, 3);
        assert_eq!(s.active, 0);
        assert_eq!(s.max_overflow, 2);
    }

    #[test]
    fn test_connection_is_reused_after_release() {
        let pool = ConnectionPool::new(quick(1, 0), FakeFactory::healthy());
        let id = pool.acquire().unwrap().id;
        let again = pool.acquire().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(pool.stats().active, 1);
    }

    #[test]
    fn test_overflow_then_exhaustion() {
        let pool = ConnectionPool::new(quick(1, 1), FakeFactory::healthy());
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id, b.id);
        assert_eq!(pool.stats().active, 2);

        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, Error::PoolExhausted { attempts: 3, .. }));
        assert!(err.is_capacity());
        assert_eq!(pool.stats().exhausted, 1);

        drop(b);
        // The idle set holds one connection; the overflow one is closed.
        drop(a);
        let s = pool.stats();
        assert_eq!(s.current_size, 1);
        assert_eq!(s.available, 1);
    }

    #[test]
    fn test_invalid_connections_are_replaced() {
        let factory = FakeFactory::healthy();
        let pool = ConnectionPool::new(quick(2, 0), factory);
        pool.factory().healthy.store(false, Ordering::SeqCst);
        // Both idle connections fail the round-trip and get replaced.
        let conn = pool.acquire().unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 2);
        assert_eq!(pool.stats().current_size, 1);
    }

    #[test]
    fn test_expired_connection_is_never_handed_out() {
        let pool = ConnectionPool::new(
            quick(1, 0).with_max_lifetime(Duration::from_millis(20)),
            FakeFactory::healthy(),
        );
        let first = pool.acquire().unwrap().id;
        std::thread::sleep(Duration::from_millis(30));
        let conn = pool.acquire().unwrap();
        assert_ne!(conn.id, first);
        assert!(conn.age() < Duration::from_millis(20));
    }

    #[test]
    fn test_create_failure_is_distinguishable() {
        let factory = FakeFactory::healthy();
        factory.fail.store(true, Ordering::SeqCst);
        let pool = ConnectionPool::new(quick(2, 0), factory);
        assert_eq!(pool.stats().current_size, 0);
        let err = pool.acquire().unwrap_err();
        assert!(matches!(err, Error::ConnectionCreate { .. }));
        assert!(!err.is_capacity());
        let text = err.to_string();
        assert!(!text.contains("secret"), "credentials leaked: {text}");
        assert!(text.contains("PWD=***MASKED***"));
        assert_eq!(text.matches("Failed to create").count(), 1);
        assert_eq!(pool.stats().current_size, 0);
    }

    #[test]
    fn test_discard_closes_connection() {
        let pool = ConnectionPool::new(quick(1, 0), FakeFactory::healthy());
        let mut conn = pool.acquire().unwrap();
        conn.discard();
        drop(conn);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.stats().current_size, 0);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_close_all_refuses_new_work() {
        let pool = ConnectionPool::new(quick(2, 0), FakeFactory::healthy());
        let held = pool.acquire().unwrap();
        pool.close_all();
        assert!(matches!(pool.acquire(), Err(Error::ShuttingDown)));
        assert_eq!(pool.stats().current_size, 1);
        drop(held);
        assert_eq!(pool.stats().current_size, 0);
        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_close_all_during_release_validation_closes_connection() {
        let pool = ConnectionPool::new(quick(1, 0), FakeFactory::healthy());
        let conn = pool.acquire().unwrap();
        pool.factory().validate_delay_ms.store(200, Ordering::SeqCst);

        let releaser = std::thread::spawn(move || drop(conn));
        std::thread::sleep(Duration::from_millis(50));
        pool.close_all();
        releaser.join().unwrap();

        assert_eq!(pool.factory().closed.load(Ordering::SeqCst), 1);
        let s = pool.stats();
        assert_eq!(s.current_size, 0);
        assert_eq!(s.available, 0);
        assert!(pool.is_closed());
    }

    #[test]
    fn test_config_clamping() {
        let cfg = PoolConfig::new()
            .with_pool_size(0)
            .with_max_overflow(99)
            .with_connect_timeout(Duration::from_secs(1000))
            .normalized();
        assert_eq!(cfg.pool_size, 1);
        assert_eq!(cfg.max_overflow, 50);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(300));
    }

    #[test]
    fn test_backoff_is_capped() {
        let cfg = PoolConfig::new();
        assert_eq!(cfg.backoff(0), Duration::from_millis(50));
        assert_eq!(cfg.backoff(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff(10), Duration::from_secs(3));
        assert_eq!(cfg.backoff(40), Duration::from_secs(3));
    }
}
