use crate::config::duration_secs;
use crate::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::time::{Duration, Instant};
use tracing::{info, warn};

const SHARDS: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginLimiterConfig {
    /// Attempts allowed inside one lockout window.
    pub max_attempts: u32,
    #[serde(with = "duration_secs")]
    pub lockout_duration: Duration,
    #[serde(with = "duration_secs")]
    pub cleanup_interval: Duration,
}

impl Default for LoginLimiterConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            lockout_duration: Duration::from_secs(900),
            cleanup_interval: Duration::from_secs(1800),
        }
    }
}

impl LoginLimiterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn with_lockout_duration(mut self, d: Duration) -> Self {
        self.lockout_duration = d;
        self
    }

    pub fn with_cleanup_interval(mut self, d: Duration) -> Self {
        self.cleanup_interval = d;
        self
    }
}

/// Brute-force guard for authentication endpoints.
///
/// Keeps a rolling window of attempt timestamps per identity. Once
/// `max_attempts` fall inside the lockout window, further attempts are
/// rejected until the oldest one ages out.
pub struct LoginRateLimiter {
    cfg: LoginLimiterConfig,
    shards: Vec<Mutex<HashMap<String, VecDeque<Instant>>>>,
    last_cleanup: Mutex<Instant>,
}

impl LoginRateLimiter {
    pub fn new(cfg: LoginLimiterConfig) -> Self {
        info!(
            max_attempts = cfg.max_attempts,
            lockout_secs = cfg.lockout_duration.as_secs(),
            "login rate limiter initialized"
        );
        Self {
            cfg,
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            last_cleanup: Mutex::new(Instant::now()),
        }
    }

    fn shard(&self, identity: &str) -> &Mutex<HashMap<String, VecDeque<Instant>>> {
        let mut hasher = DefaultHasher::new();
        identity.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % self.shards.len()]
    }

    fn prune(&self, attempts: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = attempts.front() {
            if now.saturating_duration_since(*oldest) >= self.cfg.lockout_duration {
                attempts.pop_front();
            } else {
                break;
            }
        }
    }

    fn remaining_lockout(&self, attempts: &VecDeque<Instant>, now: Instant) -> Duration {
        if (attempts.len() as u64) < u64::from(self.cfg.max_attempts) {
            return Duration::ZERO;
        }
        attempts
            .front()
            .map(|oldest| {
                self.cfg
                    .lockout_duration
                    .saturating_sub(now.saturating_duration_since(*oldest))
            })
            .unwrap_or(Duration::ZERO)
    }

    /// Record an attempt for `identity` and return how many remain in the window.
    pub fn check_attempt(&self, identity: &str) -> Result<u32> {
        self.check_attempt_at(identity, Instant::now())
    }

    pub fn check_attempt_at(&self, identity: &str, now: Instant) -> Result<u32> {
        self.maybe_cleanup(now);

        let mut shard = self.shard(identity).lock();
        let attempts = shard.entry(identity.to_string()).or_default();
        self.prune(attempts, now);

        let current = attempts.len() as u64;
        if current >= u64::from(self.cfg.max_attempts) {
            let retry_after = self.remaining_lockout(attempts, now);
            warn!(
                identity,
                attempts = current,
                max_attempts = self.cfg.max_attempts,
                retry_after_secs = retry_after.as_secs(),
                "login attempt blocked"
            );
            return Err(Error::LoginLocked {
                identity: identity.to_string(),
                retry_after,
            });
        }

        attempts.push_back(now);
        Ok(self.cfg.max_attempts.saturating_sub(attempts.len() as u32))
    }

    /// Remaining lockout for `identity`; zero when not locked.
    pub fn lockout_remaining(&self, identity: &str) -> Duration {
        self.lockout_remaining_at(identity, Instant::now())
    }

    pub fn lockout_remaining_at(&self, identity: &str, now: Instant) -> Duration {
        let mut shard = self.shard(identity).lock();
        match shard.get_mut(identity) {
            Some(attempts) => {
                self.prune(attempts, now);
                self.remaining_lockout(attempts, now)
            }
            None => Duration::ZERO,
        }
    }

    /// Forget the attempt history, e.g. after a successful login.
    pub fn reset(&self, identity: &str) {
        if self.shard(identity).lock().remove(identity).is_some() {
            info!(identity, "reset login attempts");
        }
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

    /// Drop expired attempts and identities with none left.
    pub fn evict_idle_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for shard in &self.shards {
            let mut map = shard.lock();
            let before = map.len();
            map.retain(|_, attempts| {
                self.prune(attempts, now);
                !attempts.is_empty()
            });
            removed += before - map.len();
        }
        if removed > 0 {
            info!(removed, "cleaned up idle login attempt records");
        }
        removed
    }

    pub fn tracked_identities(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }
}
