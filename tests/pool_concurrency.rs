//! Connection pool behavior under concurrent load

use ai_governor::pool::{ConnectionFactory, ConnectionPool, PoolConfig};
use ai_governor::{Error, Result};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// Tracks which connection ids are lent out, to catch double hand-outs.
#[derive(Default)]
struct Ledger {
    lent: Mutex<HashSet<u64>>,
    peak: AtomicUsize,
    violations: AtomicUsize,
}

struct CountingFactory {
    next: AtomicU64,
    ledger: Arc<Ledger>,
}

struct Conn {
    id: u64,
    ledger: Arc<Ledger>,
    healthy: AtomicBool,
}

impl Conn {
    fn begin(&self) {
        let mut lent = self.ledger.lent.lock().unwrap();
        if !lent.insert(self.id) {
            self.ledger.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.ledger.peak.fetch_max(lent.len(), Ordering::SeqCst);
    }

    fn end(&self) {
        self.ledger.lent.lock().unwrap().remove(&self.id);
    }
}

impl ConnectionFactory for CountingFactory {
    type Connection = Conn;

    fn connect(&self, _timeout: Duration) -> Result<Conn> {
        Ok(Conn {
            id: self.next.fetch_add(1, Ordering::SeqCst),
            ledger: self.ledger.clone(),
            healthy: AtomicBool::new(true),
        })
    }

    fn is_valid(&self, conn: &mut Conn) -> bool {
        conn.healthy.load(Ordering::SeqCst)
    }
}

fn pool(cfg: PoolConfig) -> (ConnectionPool<CountingFactory>, Arc<Ledger>) {
    let ledger = Arc::new(Ledger::default());
    let factory = CountingFactory {
        next: AtomicU64::new(0),
        ledger: ledger.clone(),
    };
    (ConnectionPool::new(cfg, factory), ledger)
}

#[test]
fn test_active_never_exceeds_cap_and_no_shared_connections() {
    let (pool, ledger) = pool(
        PoolConfig::new()
            .with_pool_size(2)
            .with_max_overflow(2)
            .with_checkout_wait(Duration::from_millis(20))
            .with_acquire_retries(50)
            .with_retry_backoff(Duration::from_millis(1), Duration::from_millis(5)),
    );
    let cap = pool.config().max_connections();
    let exhausted = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..16)
        .map(|_| {
            let pool = pool.clone();
            let exhausted = exhausted.clone();
            thread::spawn(move || {
                for _ in 0..25 {
                    match pool.acquire() {
                        Ok(conn) => {
                            conn.begin();
                            assert!(pool.stats().active <= cap);
                            thread::sleep(Duration::from_micros(300));
                            conn.end();
                        }
                        Err(Error::PoolExhausted { .. }) => {
                            exhausted.fetch_add(1, Ordering::SeqCst);
                        }
                        Err(other) => panic!("unexpected error: {other}"),
                    }
                }
            })
        })
        .collect();
    for w in workers {
        w.join().unwrap();
    }

    assert_eq!(ledger.violations.load(Ordering::SeqCst), 0);
    assert!(ledger.peak.load(Ordering::SeqCst) <= cap);
    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert!(stats.current_size <= cap);
    assert!(stats.available <= stats.pool_size);
}

#[test]
fn test_exhaustion_is_bounded_in_time() {
    let (pool, _) = pool(
        PoolConfig::new()
            .with_pool_size(1)
            .with_max_overflow(0)
            .with_checkout_wait(Duration::from_millis(10))
            .with_acquire_retries(2)
            .with_retry_backoff(Duration::from_millis(5), Duration::from_millis(20)),
    );
    let _held = pool.acquire().unwrap();

    let started = std::time::Instant::now();
    let err = pool.acquire().unwrap_err();
    let elapsed = started.elapsed();
    match err {
        Error::PoolExhausted { attempts, waited } => {
            assert_eq!(attempts, 3);
            assert!(waited >= Duration::from_millis(30));
        }
        other => panic!("expected exhaustion, got {other}"),
    }
    assert!(elapsed < Duration::from_secs(2));
}

#[test]
fn test_waiter_gets_connection_released_by_another_thread() {
    let (pool, _) = pool(
        PoolConfig::new()
            .with_pool_size(1)
            .with_max_overflow(0)
            .with_checkout_wait(Duration::from_millis(500))
            .with_acquire_retries(1),
    );
    let held = pool.acquire().unwrap();
    let held_id = held.id;

    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.acquire().map(|c| c.id))
    };
    thread::sleep(Duration::from_millis(50));
    drop(held);

    assert_eq!(waiter.join().unwrap().unwrap(), held_id);
}

#[test]
fn test_unhealthy_connection_is_not_returned() {
    let (pool, _) = pool(PoolConfig::new().with_pool_size(1).with_max_overflow(0));
    let first = {
        let conn = pool.acquire().unwrap();
        conn.healthy.store(false, Ordering::SeqCst);
        conn.id
    };
    // Validation on release destroyed it; the next acquire opens a fresh one.
    let next = pool.acquire().unwrap();
    assert_ne!(next.id, first);
    assert_eq!(pool.stats().destroyed, 1);
}

#[test]
fn test_panicking_borrower_still_releases() {
    let (pool, _) = pool(PoolConfig::new().with_pool_size(1).with_max_overflow(0));
    let p = pool.clone();
    let outcome = thread::spawn(move || {
        let _conn = p.acquire().unwrap();
        panic!("request handler crashed");
    })
    .join();
    assert!(outcome.is_err());

    let stats = pool.stats();
    assert_eq!(stats.active, 0);
    assert!(pool.acquire().is_ok());
}
