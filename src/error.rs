use crate::error_code::GovernorErrorCode;
use std::time::Duration;
use thiserror::Error;

/// Structured error context for better error handling and debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorContext {
    /// Field path or configuration key that caused the error (e.g., "queue.max_workers")
    pub field_path: Option<String>,
    /// Additional context about the error (e.g., expected range, actual value)
    pub details: Option<String>,
    /// Source of the error (e.g., "connection_pool", "task_queue")
    pub source: Option<String>,
}

impl ErrorContext {
    pub fn new() -> Self {
        Self {
            field_path: None,
            details: None,
            source: None,
        }
    }

    pub fn with_field_path(mut self, path: impl Into<String>) -> Self {
        self.field_path = Some(path.into());
        self
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }
}

impl Default for ErrorContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Unified error type for the governance layer.
///
/// Capacity variants (`QueueFull`, `PoolExhausted`, `RateLimited`, `LoginLocked`,
/// `CircuitOpen`) are expected outcomes the caller should turn into backpressure.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Task queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("Task queue is shutting down")]
    ShuttingDown,

    #[error("All queue workers have stopped and restart is disabled")]
    WorkersDrained,

    #[error("Connection pool exhausted after {attempts} attempts ({waited:?} waited)")]
    PoolExhausted { attempts: u32, waited: Duration },

    #[error("Failed to create database connection: {message}")]
    ConnectionCreate { message: String },

    #[error("Rate limit exceeded ({window}) for {identity}, retry after {retry_after:?}")]
    RateLimited {
        identity: String,
        window: &'static str,
        retry_after: Duration,
    },

    #[error("Too many login attempts for {identity}, locked for {retry_after:?}")]
    LoginLocked {
        identity: String,
        retry_after: Duration,
    },

    #[error("Circuit breaker '{name}' is open, retry after {retry_after:?}")]
    CircuitOpen { name: String, retry_after: Duration },

    #[error("Configuration error: {message}{}", format_context(.context))]
    Configuration {
        message: String,
        context: ErrorContext,
    },

    #[error("Validation error: {message}{}", format_context(.context))]
    Validation {
        message: String,
        context: ErrorContext,
    },

    #[error("Runtime error: {message}{}", format_context(.context))]
    Runtime {
        message: String,
        context: ErrorContext,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

// Helper function to format error context for display
fn format_context(ctx: &ErrorContext) -> String {
    let mut parts = Vec::new();
    if let Some(ref field) = ctx.field_path {
        parts.push(format!("field: {}", field));
    }
    if let Some(ref details) = ctx.details {
        parts.push(format!("details: {}", details));
    }
    if let Some(ref source) = ctx.source {
        parts.push(format!("source: {}", source));
    }
    if parts.is_empty() {
        String::new()
    } else {
        format!(" ({})", parts.join(", "))
    }
}

impl Error {
    /// Create a new runtime error with structured context
    pub fn runtime_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Runtime {
            message: msg.into(),
            context,
        }
    }

    /// Create a new validation error with structured context
    pub fn validation_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Validation {
            message: msg.into(),
            context,
        }
    }

    /// Create a new configuration error with structured context
    pub fn configuration_with_context(msg: impl Into<String>, context: ErrorContext) -> Self {
        Error::Configuration {
            message: msg.into(),
            context,
        }
    }

    /// Extract error context if available
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            Error::Configuration { context, .. }
            | Error::Validation { context, .. }
            | Error::Runtime { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Stable error code for this error.
    pub fn code(&self) -> GovernorErrorCode {
        GovernorErrorCode::from_error(self)
    }

    /// True for expected, recoverable-by-caller conditions (backpressure signals).
    pub fn is_capacity(&self) -> bool {
        self.code().category() == "capacity"
    }

    /// Suggested delay before the caller retries, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Error::RateLimited { retry_after, .. }
            | Error::LoginLocked { retry_after, .. }
            | Error::CircuitOpen { retry_after, .. } => Some(*retry_after),
            Error::PoolExhausted { .. } | Error::QueueFull { .. } => Some(Duration::from_secs(1)),
            _ => None,
        }
    }
}
