//! Governor configuration
//!
//! Typed aggregate of every component config. Loaded once from YAML or JSON,
//! overlaid with environment variables, then validated before any component
//! is constructed.

use crate::pool::PoolConfig;
use crate::queue::QueueConfig;
use crate::resilience::circuit_breaker::CircuitBreakerConfig;
use crate::resilience::login_limiter::LoginLimiterConfig;
use crate::resilience::rate_limiter::RateLimitConfig;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Serde adapter writing durations as (fractional) seconds.
pub mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(d: &Duration, s: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        s.serialize_f64(d.as_secs_f64())
    }

    pub fn deserialize<'de, D>(d: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(d)?;
        Duration::try_from_secs_f64(secs).map_err(|e| {
            serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}: {e}"
            ))
        })
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub queue: QueueConfig,
    pub pool: PoolConfig,
    pub rate_limit: RateLimitConfig,
    pub login: LoginLimiterConfig,
    pub breaker: CircuitBreakerConfig,
}

impl GovernorConfig {
    pub fn from_yaml_str(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load from a file; `.yaml`/`.yml` are parsed as YAML, everything else as JSON.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => Self::from_yaml_str(&text),
            _ => Self::from_json_str(&text),
        }
    }

    /// Overlay values from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Overlay values from an arbitrary lookup (the environment in production).
    /// Unparsable values are logged and ignored.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        override_num(&lookup, "RATE_LIMIT_PER_MINUTE", &mut self.rate_limit.requests_per_minute);
        override_num(&lookup, "RATE_LIMIT_PER_HOUR", &mut self.rate_limit.requests_per_hour);
        override_num(&lookup, "DATABASE_POOL_SIZE", &mut self.pool.pool_size);
        override_num(&lookup, "DATABASE_MAX_OVERFLOW", &mut self.pool.max_overflow);
        override_num(&lookup, "QUEUE_MAX_WORKERS", &mut self.queue.max_workers);
        override_num(&lookup, "QUEUE_MAX_SIZE", &mut self.queue.max_queue_size);
        override_num(&lookup, "BREAKER_FAILURE_THRESHOLD", &mut self.breaker.failure_threshold);
        override_num(&lookup, "LOGIN_MAX_ATTEMPTS", &mut self.login.max_attempts);

        let mut recovery = self.breaker.recovery_timeout.as_secs();
        if override_num(&lookup, "BREAKER_RECOVERY_TIMEOUT_SECS", &mut recovery) {
            self.breaker.recovery_timeout = Duration::from_secs(recovery);
        }
        let mut lockout = self.login.lockout_duration.as_secs();
        if override_num(&lookup, "LOGIN_LOCKOUT_SECS", &mut lockout) {
            self.login.lockout_duration = Duration::from_secs(lockout);
        }
    }

    /// Check every section once. Pool sizes are clamped rather than rejected.
    pub fn validate(mut self) -> Result<Self> {
        self.queue.validate()?;
        self.pool = self.pool.normalized();

        require_nonzero(self.rate_limit.requests_per_minute as u64, "rate_limit.requests_per_minute")?;
        require_nonzero(self.rate_limit.requests_per_hour as u64, "rate_limit.requests_per_hour")?;
        require_positive(self.rate_limit.cleanup_interval, "rate_limit.cleanup_interval")?;
        require_positive(self.rate_limit.idle_eviction, "rate_limit.idle_eviction")?;

        require_nonzero(self.login.max_attempts as u64, "login.max_attempts")?;
        require_positive(self.login.lockout_duration, "login.lockout_duration")?;
        require_positive(self.login.cleanup_interval, "login.cleanup_interval")?;

        require_nonzero(self.breaker.failure_threshold as u64, "breaker.failure_threshold")?;
        require_positive(self.breaker.recovery_timeout, "breaker.recovery_timeout")?;
        if self.breaker.name.trim().is_empty() {
            return Err(config_error("breaker name must not be empty", "breaker.name"));
        }
        Ok(self)
    }

    /// Read, overlay the environment, validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let mut cfg = Self::from_path(path)?;
        cfg.apply_env_overrides();
        cfg.validate()
    }
}

fn override_num<T, F>(lookup: &F, key: &str, slot: &mut T) -> bool
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return false;
    };
    match raw.trim().parse::<T>() {
        Ok(v) => {
            *slot = v;
            true
        }
        Err(_) => {
            warn!(key, value = %raw, "ignoring unparsable configuration override");
            false
        }
    }
}

pub(crate) fn config_error(msg: &str, field: &str) -> Error {
    Error::configuration_with_context(
        msg,
        ErrorContext::new()
            .with_field_path(field)
            .with_source("governor_config"),
    )
}

pub(crate) fn require_nonzero(v: u64, field: &str) -> Result<()> {
    if v == 0 {
        return Err(config_error("value must be greater than zero", field));
    }
    Ok(())
}

pub(crate) fn require_positive(d: Duration, field: &str) -> Result<()> {
    if d.is_zero() {
        return Err(config_error("duration must be greater than zero", field));
    }
    Ok(())
}
