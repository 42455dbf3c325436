//! 标准错误码：为治理层的每类错误定义稳定的错误码及其边界映射。
//!
//! Standard error codes for the governance layer.
//!
//! Every [`Error`](crate::Error) maps to exactly one code. The HTTP layer uses the
//! code, never the display string, to choose the user-visible response.
//!
//! ## Error Code Categories
//!
//! | Prefix | Category      | Description                                   |
//! |--------|---------------|-----------------------------------------------|
//! | G1xxx  | capacity      | Expected backpressure (queue, pool, limits)   |
//! | G2xxx  | upstream      | Dependency failures (database, inference API) |
//! | G3xxx  | lifecycle     | Shutdown and worker supervision               |
//! | G4xxx  | configuration | Invalid or unparsable configuration           |
//! | G9xxx  | unknown       | Catch-all / unclassified                      |
//!
//! ## Example
//!
//! ```rust
//! use ai_governor::error_code::{BoundaryHint, GovernorErrorCode};
//!
//! let code = GovernorErrorCode::CircuitOpen;
//! assert_eq!(code.code(), "G1005");
//! assert_eq!(code.category(), "capacity");
//! assert_eq!(code.boundary_hint(), BoundaryHint::ServiceBusy);
//! assert_eq!(code.boundary_hint().http_status(), 503);
//! ```

use crate::Error;
use std::fmt;

/// Standard governance error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GovernorErrorCode {
    /// G1001: Bounded task queue has no capacity left
    QueueFull,
    /// G1002: No pooled connection became available within the bounded wait
    PoolExhausted,
    /// G1003: Client exceeded its per-minute or per-hour budget
    RateLimited,
    /// G1004: Identity is locked out after repeated login attempts
    LoginLocked,
    /// G1005: Circuit breaker is open for the protected dependency
    CircuitOpen,
    /// G2001: Connection factory failed to create a connection
    ConnectionCreate,
    /// G3001: Queue no longer accepts work
    ShuttingDown,
    /// G3002: Every worker self-terminated and restart is disabled
    WorkersDrained,
    /// G3003: Internal runtime failure (e.g. poisoned lock)
    Runtime,
    /// G4001: Configuration value rejected
    Configuration,
    /// G4002: Input failed validation
    Validation,
    /// G4003: Configuration document could not be parsed
    Parse,
    /// G9999: Error could not be classified
    Unknown,
}

/// User-visible reaction the boundary layer should choose for an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoundaryHint {
    /// "Try again shortly", with the retry hint of the error.
    RetryLater,
    /// Generic "service busy" instead of an internal error.
    ServiceBusy,
    /// Genuine internal failure.
    Internal,
}

impl BoundaryHint {
    /// Suggested HTTP status code.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::RetryLater => 429,
            Self::ServiceBusy => 503,
            Self::Internal => 500,
        }
    }
}

impl GovernorErrorCode {
    /// Returns the canonical code string (e.g., `"G1001"`).
    #[inline]
    pub fn code(&self) -> &'static str {
        match self {
            Self::QueueFull => "G1001",
            Self::PoolExhausted => "G1002",
            Self::RateLimited => "G1003",
            Self::LoginLocked => "G1004",
            Self::CircuitOpen => "G1005",
            Self::ConnectionCreate => "G2001",
            Self::ShuttingDown => "G3001",
            Self::WorkersDrained => "G3002",
            Self::Runtime => "G3003",
            Self::Configuration => "G4001",
            Self::Validation => "G4002",
            Self::Parse => "G4003",
            Self::Unknown => "G9999",
        }
    }

    /// Returns the standard name (e.g., `"queue_full"`).
    #[inline]
    pub fn name(&self) -> &'static str {
        match self {
            Self::QueueFull => "queue_full",
            Self::PoolExhausted => "pool_exhausted",
            Self::RateLimited => "rate_limited",
            Self::LoginLocked => "login_locked",
            Self::CircuitOpen => "circuit_open",
            Self::ConnectionCreate => "connection_create",
            Self::ShuttingDown => "shutting_down",
            Self::WorkersDrained => "workers_drained",
            Self::Runtime => "runtime",
            Self::Configuration => "configuration",
            Self::Validation => "validation",
            Self::Parse => "parse",
            Self::Unknown => "unknown",
        }
    }

    /// Returns the category: `"capacity"`, `"upstream"`, `"lifecycle"`,
    /// `"configuration"`, or `"unknown"`.
    #[inline]
    pub fn category(&self) -> &'static str {
        match self {
            Self::QueueFull
            | Self::PoolExhausted
            | Self::RateLimited
            | Self::LoginLocked
            | Self::CircuitOpen => "capacity",
            Self::ConnectionCreate => "upstream",
            Self::ShuttingDown | Self::WorkersDrained | Self::Runtime => "lifecycle",
            Self::Configuration | Self::Validation | Self::Parse => "configuration",
            Self::Unknown => "unknown",
        }
    }

    /// Returns whether a caller may retry the same operation later.
    #[inline]
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::QueueFull
                | Self::PoolExhausted
                | Self::RateLimited
                | Self::LoginLocked
                | Self::CircuitOpen
                | Self::ConnectionCreate
        )
    }

    /// How the HTTP boundary should present this error.
    pub fn boundary_hint(&self) -> BoundaryHint {
        match self {
            Self::QueueFull | Self::RateLimited | Self::LoginLocked => BoundaryHint::RetryLater,
            Self::PoolExhausted
            | Self::CircuitOpen
            | Self::ConnectionCreate
            | Self::ShuttingDown
            | Self::WorkersDrained => BoundaryHint::ServiceBusy,
            Self::Runtime
            | Self::Configuration
            | Self::Validation
            | Self::Parse
            | Self::Unknown => BoundaryHint::Internal,
        }
    }

    /// Classifies an [`Error`].
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::QueueFull { .. } => Self::QueueFull,
            Error::PoolExhausted { .. } => Self::PoolExhausted,
            Error::RateLimited { .. } => Self::RateLimited,
            Error::LoginLocked { .. } => Self::LoginLocked,
            Error::CircuitOpen { .. } => Self::CircuitOpen,
            Error::ConnectionCreate { .. } => Self::ConnectionCreate,
            Error::ShuttingDown => Self::ShuttingDown,
            Error::WorkersDrained => Self::WorkersDrained,
            Error::Runtime { .. } => Self::Runtime,
            Error::Configuration { .. } => Self::Configuration,
            Error::Validation { .. } => Self::Validation,
            Error::Serialization(_) | Error::Yaml(_) => Self::Parse,
            Error::Io(_) => Self::Unknown,
        }
    }
}

impl fmt::Display for GovernorErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_codes_are_retryable() {
        for code in [
            GovernorErrorCode::QueueFull,
            GovernorErrorCode::PoolExhausted,
            GovernorErrorCode::RateLimited,
            GovernorErrorCode::LoginLocked,
            GovernorErrorCode::CircuitOpen,
        ] {
            assert_eq!(code.category(), "capacity", "{}", code.name());
            assert!(code.retryable(), "{}", code.name());
        }
    }

    #[test]
    fn test_breaker_and_pool_map_to_service_busy() {
        let open = Error::CircuitOpen {
            name: "inference_api".into(),
            retry_after: Duration::from_secs(3),
        };
        assert_eq!(open.code().boundary_hint(), BoundaryHint::ServiceBusy);

        let exhausted = Error::PoolExhausted {
            attempts: 3,
            waited: Duration::from_millis(300),
        };
        assert_eq!(exhausted.code().boundary_hint().http_status(), 503);
    }

    #[test]
    fn test_rate_limit_maps_to_retry_later() {
        let err = Error::RateLimited {
            identity: "1.2.3.4".into(),
            window: "hour",
            retry_after: Duration::from_secs(7),
        };
        assert_eq!(err.code(), GovernorErrorCode::RateLimited);
        assert_eq!(err.code().boundary_hint().http_status(), 429);
        assert_eq!(err.code().to_string(), "G1003");
    }

    #[test]
    fn test_configuration_is_internal() {
        let err = Error::configuration_with_context("bad", crate::ErrorContext::new());
        assert!(!err.is_capacity());
        assert_eq!(err.code().boundary_hint(), BoundaryHint::Internal);
    }
}
