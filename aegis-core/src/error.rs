use std::time::Duration;
use thiserror::Error;

pub type AegisResult<T> = Result<T, AegisError>;

/// Errors surfaced by guarded operations and by the resilience core itself.
///
/// Variants map onto the classification taxonomy (network, validation,
/// auth, processing, system); the classifier consumes these to produce
/// user-facing records.
#[derive(Error, Debug)]
pub enum AegisError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Operation '{operation}' timed out after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Validation error for {field}: {message}")]
    Validation { field: String, message: String },

    #[error("Authentication error: {message}")]
    Auth { message: String, expired: bool },

    #[error("Processing operation '{operation}' failed: {details}")]
    Processing { operation: String, details: String },

    #[error("Storage operation '{operation}' failed")]
    Storage {
        operation: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Circuit breaker '{breaker}' is open")]
    CircuitOpen { breaker: String },

    #[error("Operation '{operation}' was cancelled")]
    Cancelled { operation: String },

    /// Set after a critical, non-recoverable failure; the operation stays
    /// locked until the user acknowledges it.
    #[error("Operation '{operation}' is disabled pending user action")]
    OperationLocked { operation: String },

    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

impl AegisError {
    /// Shorthand for a storage failure wrapping an arbitrary backend error.
    pub fn storage(
        operation: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Storage {
            operation: operation.into(),
            source: Box::new(source),
        }
    }
}
