use crate::config::duration_secs;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const SHARDS: usize = 16;

#[derive(Debug, Clone, Copy)]
pub struct BucketSnapshot {
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Estimated wait until one token is available, if currently empty.
    pub estimated_wait: Option<Duration>,
}

/// Lazily refilled token bucket.
///
/// Not synchronized on its own; owners keep it behind a lock.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens per second.
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        Self::new_at(capacity, refill_rate, Instant::now())
    }

    pub fn new_at(capacity: u32, refill_rate: f64, now: Instant) -> Self {
        let capacity = f64::from(capacity);
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
        }
    }

    /// Bucket holding `capacity` tokens that refills completely over `window`.
    pub fn per_window(capacity: u32, window: Duration, now: Instant) -> Self {
        let secs = window.as_secs_f64().max(f64::EPSILON);
        Self::new_at(capacity, f64::from(capacity) / secs, now)
    }

    fn refill_locked(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
            self.last_refill = now;
        }
    }

    fn wait_for(&self, n: f64) -> Duration {
        if self.tokens >= n {
            return Duration::ZERO;
        }
        if self.refill_rate <= 0.0 || n > self.capacity {
            return Duration::MAX;
        }
        Duration::from_secs_f64((n - self.tokens) / self.refill_rate)
    }

    /// Refill, then take `n` tokens if available. On failure nothing is taken
    /// and the wait until `n` tokens will be available is returned.
    pub fn try_consume_at(&mut self, n: u32, now: Instant) -> std::result::Result<(), Duration> {
        self.refill_locked(now);
        let n = f64::from(n);
        if self.tokens >= n {
            self.tokens -= n;
            Ok(())
        } else {
            Err(self.wait_for(n))
        }
    }

    pub fn try_consume(&mut self, n: u32) -> std::result::Result<(), Duration> {
        self.try_consume_at(n, Instant::now())
    }

    /// Remove `n` tokens already known to be available. Callers check
    /// [`wait_time_at`](Self::wait_time_at) first; the level never drops below zero.
    fn take(&mut self, n: u32) {
        self.tokens = (self.tokens - f64::from(n)).max(0.0);
    }

    /// Refill and report how long until `n` tokens are available, without taking any.
    pub fn wait_time_at(&mut self, n: u32, now: Instant) -> Duration {
        self.refill_locked(now);
        self.wait_for(f64::from(n))
    }

    pub fn last_refill(&self) -> Instant {
        self.last_refill
    }

    pub fn snapshot_at(&mut self, now: Instant) -> BucketSnapshot {
        self.refill_locked(now);
        let wait = self.wait_for(1.0);
        BucketSnapshot {
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            tokens: self.tokens,
            estimated_wait: (!wait.is_zero()).then_some(wait),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: u32,
    /// How often idle identities are swept.
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
    /// Identities untouched for this long are evicted.
    #[serde(with = "duration_secs")]
    pub idle_eviction: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 30,
            requests_per_hour: 500,
            cleanup_interval: Duration::from_secs(3600),
            idle_eviction: Duration::from_secs(7200),
        }
    }
}

impl RateLimitConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_per_minute(mut self, n: u32) -> Self {
        self.requests_per_minute = n;
        self
    }

    pub fn with_per_hour(mut self, n: u32) -> Self {
        self.requests_per_hour = n;
        self
    }

    pub fn with_idle_eviction(mut self, idle: Duration) -> Self {
        self.idle_eviction = idle;
        self
    }

    pub fn with_cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }
}

/// Configured limits, for response headers such as `X-RateLimit-Limit-Minute`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimits {
    pub per_minute: u32,
    pub per_hour: u32,
}

#[derive(Debug)]
struct ClientBuckets {
    minute: TokenBucket,
    hour: TokenBucket,
    last_seen: Instant,
}

impl ClientBuckets {
    fn new(cfg: &RateLimitConfig, now: Instant) -> Self {
        Self {
            minute: TokenBucket::per_window(cfg.requests_per_minute, Duration::from_secs(60), now),
            hour: TokenBucket::per_window(cfg.requests_per_hour, Duration::from_secs(3600), now),
            last_seen: now,
        }
    }
}

/// Per-client limiter enforcing a per-minute and a per-hour token bucket.
///
/// Identities are spread over independently locked shards, so requests from
/// different clients rarely contend.
pub struct ClientRateLimiter {
    cfg: RateLimitConfig,
    shards: Vec<Mutex<HashMap<String, ClientBuckets>>>,
    last_cleanup: Mutex<Instant>,
}

impl ClientRateLimiter {
    pub fn new(cfg: RateLimitConfig) -> Self {
        info!(
            per_minute = cfg.requests_per_minute,
            per_hour = cfg.requests_per_hour,
            "rate limiter initialized"
        );
        Self {
            cfg,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    fn shard(&self, identity: &str) -> &Mutex<HashMap<String, ClientBuckets>> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    pub fn limits(&self) -> RateLimits {
        RateLimits {
            per_minute: self.cfg.requests_per_minute,
            per_hour: self.cfg.requests_per_hour,
        }
    }

    /// Admit one request for `identity`, or fail with the retry hint.
    pub fn check(&self, identity: &str) -> Result<()> {
        self.check_at(identity, Instant::now())
    }

    /// Both buckets must have a token; tokens are only taken when both do.
    /// On rejection the larger of the rejecting buckets' waits is reported.
    pub fn check_at(&self, identity: &str, now: Instant) -> Result<()> {
        self.maybe_cleanup(now);

        let mut shard = self.shard(identity).lock();
        let buckets = shard
            .entry(identity.to_string())
            .or_insert_with(|| ClientBuckets::new(&self.cfg, now));
        buckets.last_seen = now;

        let minute_wait = buckets.minute.wait_time_at(1, now);
        let hour_wait = buckets.hour.wait_time_at(1, now);
        if minute_wait.is_zero() && hour_wait.is_zero() {
            buckets.minute.take(1);
            buckets.hour.take(1);
            return Ok(());
        }

        let (window, retry_after) = if hour_wait > minute_wait {
            ("hour", hour_wait)
        } else {
            ("minute", minute_wait)
        };
        warn!(
            identity,
            window,
            retry_after_secs = retry_after.as_secs_f64(),
            "rate limit exceeded"
        );
        Err(Error::RateLimited {
            identity: identity.to_string(),
            window,
            retry_after,
        })
    }

    fn maybe_cleanup(&self, now: Instant) {
        {
            let mut last = self.last_cleanup.lock();
            if now.saturating_duration_since(*last) < self.cfg.cleanup_interval {
                return;
            }
            *last = now;
        }
        self.evict_idle_at(now);
    }

    /// Drop identities not seen within the idle window. Returns how many were removed.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, b| now.saturating_duration_since(b.last_seen) <= self.cfg.idle_eviction);
            removed += before - map.len();
        }
        if removed > 0 {
            info!(removed, "cleaned up idle rate limit buckets");
        } else {
            debug!("rate limit sweep found nothing to evict");
        }
        removed
    }

    pub fn evict_idle(&self) -> usize {
        self.evict_idle_at(Instant::now())
    }

    pub fn bucket_count(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_starts_full_and_drains() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(3, 1.0, now);
        for _ in 0..3 {
            assert!(bucket.try_consume_at(1, now).is_ok());
        }
        let wait = bucket.try_consume_at(1, now).unwrap_err();
        assert!((wait.as_secs_f64() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_bucket_reports_wait_for_n_tokens() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(10, 2.0, now);
        assert!(bucket.try_consume_at(10, now).is_ok());
        let wait = bucket.try_consume_at(4, now).unwrap_err();
        assert!((wait.as_secs_f64() - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_bucket_never_exceeds_capacity() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(5, 100.0, now);
        let snap = bucket.snapshot_at(now + Duration::from_secs(60));
        assert_eq!(snap.tokens, 5.0);
        assert!(snap.estimated_wait.is_none());
    }

    #[test]
    fn test_refill_after_one_over_rate() {
        let now = Instant::now();
        // 5 tokens per second
        let mut bucket = TokenBucket::per_window(5, Duration::from_secs(1), now);
        for _ in 0..5 {
            assert!(bucket.try_consume_at(1, now).is_ok());
        }
        assert!(bucket
            .try_consume_at(1, now + Duration::from_millis(150))
            .is_err());
        assert!(bucket
            .try_consume_at(1, now + Duration::from_millis(250))
            .is_ok());
    }

    #[test]
    fn test_admission_takes_one_token_from_each_window() {
        let limiter = ClientRateLimiter::new(
            RateLimitConfig::new().with_per_minute(3).with_per_hour(10),
        );
        let now = Instant::now();
        limiter.check_at("a", now).unwrap();
        limiter.check_at("a", now).unwrap();

        let mut shard = limiter.shard("a").lock();
        let buckets = shard.get_mut("a").unwrap();
        assert!((buckets.minute.snapshot_at(now).tokens - 1.0).abs() < 1e-9);
        assert!((buckets.hour.snapshot_at(now).tokens - 8.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_request_never_fits() {
        let now = Instant::now();
        let mut bucket = TokenBucket::new_at(2, 1.0, now);
        assert_eq!(bucket.try_consume_at(3, now).unwrap_err(), Duration::MAX);
    }

    #[test]
    fn test_minute_window_rejects_with_hint() {
        let limiter = ClientRateLimiter::new(RateLimitConfig::new().with_per_minute(2));
        let now = Instant::now();
        assert!(limiter.check_at("a", now).is_ok());
        assert!(limiter.check_at("a", now).is_ok());
        let err = limiter.check_at("a", now).unwrap_err();
        match err {
            Error::RateLimited {
                window,
                retry_after,
                ..
            } => {
                assert_eq!(window, "minute");
                assert!((retry_after.as_secs_f64() - 30.0).abs() < 1e-3);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Other identities are unaffected.
        assert!(limiter.check_at("b", now).is_ok());
    }

    #[test]
    fn test_hour_window_wait_wins_when_larger() {
        let limiter = ClientRateLimiter::new(
            RateLimitConfig::new().with_per_minute(60).with_per_hour(2),
        );
        let now = Instant::now();
        assert!(limiter.check_at("c", now).is_ok());
        assert!(limiter.check_at("c", now).is_ok());
        let err = limiter.check_at("c", now).unwrap_err();
        assert!(matches!(err, Error::RateLimited { window: "hour", .. }));
        assert!(err.retry_after().unwrap() >= Duration::from_secs(1799));
    }

    #[test]
    fn test_rejection_does_not_consume_minute_token() {
        let limiter = ClientRateLimiter::new(
            RateLimitConfig::new().with_per_minute(60).with_per_hour(1),
        );
        let now = Instant::now();
        assert!(limiter.check_at("d", now).is_ok());
        for _ in 0..5 {
            assert!(limiter.check_at("d", now).is_err());
        }
        let mut shard = limiter.shard("d").lock();
        let buckets = shard.get_mut("d").unwrap();
        assert!(buckets.minute.snapshot_at(now).tokens > 58.9);
    }

    #[test]
    fn test_idle_identities_are_evicted() {
        let limiter = ClientRateLimiter::new(
            RateLimitConfig::new().with_idle_eviction(Duration::from_secs(10)),
        );
        let now = Instant::now();
        limiter.check_at("old", now).unwrap();
        limiter
            .check_at("fresh", now + Duration::from_secs(15))
            .unwrap();
        assert_eq!(limiter.bucket_count(), 2);
        assert_eq!(limiter.evict_idle_at(now + Duration::from_secs(16)), 1);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_periodic_cleanup_runs_on_check() {
        let limiter = ClientRateLimiter::new(
            RateLimitConfig::new()
                .with_idle_eviction(Duration::from_secs(5))
                .with_cleanup_interval(Duration::from_secs(10)),
        );
        let start = Instant::now();
        limiter.check_at("gone", start).unwrap();
        limiter
            .check_at("here", start + Duration::from_secs(20))
            .unwrap();
        assert_eq!(limiter.bucket_count(), 1);
    }
}
