use crate::config::duration_secs;
use crate::{Error, ErrorContext, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};

/// Breaker state for one protected dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of a breaker, suitable for health endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub failure_threshold: u32,
    /// RFC 3339 timestamp of the most recent counted failure.
    pub last_failure_time: Option<String>,
    pub recovery_timeout_ms: u64,
    /// Remaining open time in ms, if currently open.
    pub open_remaining_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: u32,
    #[serde(with = "duration_secs")]
    pub recovery_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "inference_api".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new config with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the dependency name reported in errors and status
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the failure threshold
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Set how long the circuit stays open before a trial call is allowed
    pub fn with_recovery_timeout(mut self, timeout: Duration) -> Self {
        self.recovery_timeout = timeout;
        self
    }
}

/// Error returned by [`CircuitBreaker::call`] and [`CircuitBreaker::call_async`].
#[derive(Debug, thiserror::Error)]
pub enum BreakerError<E> {
    /// The call was rejected without being attempted.
    #[error("circuit breaker '{name}' is open")]
    Open { name: String, retry_after: Duration },
    /// The wrapped call ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }

    pub fn into_inner(self) -> Option<E> {
        match self {
            BreakerError::Inner(e) => Some(e),
            BreakerError::Open { .. } => None,
        }
    }
}

impl<E> From<BreakerError<E>> for Error
where
    E: Into<Error>,
{
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { name, retry_after } => Error::CircuitOpen { name, retry_after },
            BreakerError::Inner(e) => e.into(),
        }
    }
}

#[derive(Debug)]
struct State {
    circuit: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<SystemTime>,
    /// Set while the single half-open trial call is in flight.
    trial_started: Option<Instant>,
}

/// Three-state circuit breaker.
///
/// - Counts consecutive failures while closed
/// - Rejects immediately while open, until the recovery timeout elapses
/// - Lets exactly one trial call through while half-open
pub struct CircuitBreaker {
    cfg: CircuitBreakerConfig,
    state: std::sync::Mutex<State>,
}

impl CircuitBreaker {
    pub fn new(cfg: CircuitBreakerConfig) -> Self {
        Self {
            cfg,
            state: std::sync::Mutex::new(State {
                circuit: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                trial_started: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state.lock().map_err(|_| {
            Error::runtime_with_context(
                "CircuitBreaker poisoned",
                ErrorContext::new().with_source("circuit_breaker"),
            )
        })
    }

    fn open_error(&self, retry_after: Duration) -> Error {
        Error::CircuitOpen {
            name: self.cfg.name.clone(),
            retry_after,
        }
    }

    /// Ask permission for one call. Moves `open` to `half_open` once the
    /// recovery timeout has elapsed.
    pub fn allow(&self) -> Result<()> {
        let mut st = self.lock()?;
        let now = Instant::now();
        match st.circuit {
            CircuitState::Closed => Ok(()),
            CircuitState::Open => {
                let opened_at = st.opened_at.unwrap_or(now);
                let elapsed = now.duration_since(opened_at);
                if elapsed < self.cfg.recovery_timeout {
                    return Err(self.open_error(self.cfg.recovery_timeout - elapsed));
                }
                st.circuit = CircuitState::HalfOpen;
                st.trial_started = Some(now);
                info!(breaker = %self.cfg.name, "circuit half-open, allowing trial call");
                Ok(())
            }
            CircuitState::HalfOpen => {
                // A trial whose outcome was never recorded (e.g. dropped future)
                // must not wedge the breaker forever.
                let stale = st
                    .trial_started
                    .map(|t| now.duration_since(t) >= self.cfg.recovery_timeout)
                    .unwrap_or(true);
                if stale {
                    st.trial_started = Some(now);
                    Ok(())
                } else {
                    Err(self.open_error(Duration::ZERO))
                }
            }
        }
    }

    pub fn on_success(&self) {
        if let Ok(mut st) = self.state.lock() {
            if st.circuit == CircuitState::HalfOpen {
                info!(breaker = %self.cfg.name, "trial call succeeded, circuit closed");
            }
            st.circuit = CircuitState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
            st.trial_started = None;
        }
    }

    pub fn on_failure(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.consecutive_failures = st.consecutive_failures.saturating_add(1);
            st.last_failure = Some(SystemTime::now());
            let reopen = match st.circuit {
                CircuitState::HalfOpen => true,
                CircuitState::Closed => st.consecutive_failures >= self.cfg.failure_threshold,
                CircuitState::Open => false,
            };
            if reopen {
                warn!(
                    breaker = %self.cfg.name,
                    failures = st.consecutive_failures,
                    "circuit opened"
                );
                st.circuit = CircuitState::Open;
                st.opened_at = Some(Instant::now());
            }
            st.trial_started = None;
        }
    }

    /// Release a half-open trial whose error is not counted as a failure.
    fn on_ignored(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.trial_started = None;
        }
    }

    /// Run a synchronous call through the breaker. Every error counts as a failure.
    pub fn call<T, E, F>(&self, f: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
    {
        self.call_filtered(f, |_| true)
    }

    /// Like [`call`](Self::call), but only errors for which `counts` returns
    /// true are recorded as failures.
    pub fn call_filtered<T, E, F, P>(&self, f: F, counts: P) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> std::result::Result<T, E>,
        P: Fn(&E) -> bool,
    {
        self.permit()?;
        let out = f();
        self.record(&out, counts);
        out.map_err(BreakerError::Inner)
    }

    /// Run an asynchronous call through the breaker with the same state semantics.
    pub async fn call_async<T, E, F, Fut>(&self, f: F) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        self.call_async_filtered(f, |_| true).await
    }

    pub async fn call_async_filtered<T, E, F, Fut, P>(
        &self,
        f: F,
        counts: P,
    ) -> std::result::Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        self.permit()?;
        let out = f().await;
        self.record(&out, counts);
        out.map_err(BreakerError::Inner)
    }

    fn permit<E>(&self) -> std::result::Result<(), BreakerError<E>> {
        match self.allow() {
            Ok(()) => Ok(()),
            Err(Error::CircuitOpen { name, retry_after }) => {
                Err(BreakerError::Open { name, retry_after })
            }
            // Poisoned state: fail closed rather than hammer the dependency.
            Err(_) => Err(BreakerError::Open {
                name: self.cfg.name.clone(),
                retry_after: self.cfg.recovery_timeout,
            }),
        }
    }

    fn record<T, E, P>(&self, out: &std::result::Result<T, E>, counts: P)
    where
        P: Fn(&E) -> bool,
    {
        match out {
            Ok(_) => self.on_success(),
            Err(e) if counts(e) => self.on_failure(),
            Err(_) => self.on_ignored(),
        }
    }

    /// Force the breaker back to `closed`.
    pub fn reset(&self) {
        if let Ok(mut st) = self.state.lock() {
            st.circuit = CircuitState::Closed;
            st.consecutive_failures = 0;
            st.opened_at = None;
            st.last_failure = None;
            st.trial_started = None;
        }
        info!(breaker = %self.cfg.name, "circuit manually reset");
    }

    /// Current state. An expired `open` period is reported as `half_open`
    /// without consuming the trial.
    pub fn state(&self) -> CircuitState {
        self.status().state
    }

    pub fn status(&self) -> CircuitBreakerStatus {
        let now = Instant::now();
        let recovery_timeout_ms = self.cfg.recovery_timeout.as_millis() as u64;
        match self.state.lock() {
            Ok(st) => {
                let mut state = st.circuit;
                let mut open_remaining_ms = None;
                if st.circuit == CircuitState::Open {
                    let until = st.opened_at.unwrap_or(now) + self.cfg.recovery_timeout;
                    if until > now {
                        open_remaining_ms = Some((until - now).as_millis() as u64);
                    } else {
                        state = CircuitState::HalfOpen;
                    }
                }
                CircuitBreakerStatus {
                    name: self.cfg.name.clone(),
                    state,
                    failure_count: st.consecutive_failures,
                    failure_threshold: self.cfg.failure_threshold,
                    last_failure_time: st
                        .last_failure
                        .map(|t| DateTime::<Utc>::from(t).to_rfc3339()),
                    recovery_timeout_ms,
                    open_remaining_ms,
                }
            }
            Err(_) => CircuitBreakerStatus {
                name: self.cfg.name.clone(),
                state: CircuitState::Open,
                failure_count: 0,
                failure_threshold: self.cfg.failure_threshold,
                last_failure_time: None,
                recovery_timeout_ms,
                open_remaining_ms: None,
            },
        }
    }
}
