//! Error types for the resilience and caching core.

use super::categories::{ErrorCategory, NetworkErrorKind};
use std::time::Duration;
use thiserror::Error;

/// Result type alias for resilience operations
pub type ResilienceResult<T> = Result<T, ResilienceError>;

/// Main error type for the resilience and caching core.
///
/// Operations wrapped by the [`ResilienceManager`](crate::ResilienceManager)
/// return this type, so the retry predicate and the circuit breaker can
/// classify caller failures and the guards' own rejections uniformly.
#[derive(Error, Debug, Clone)]
pub enum ResilienceError {
    /// Transport-level failure (reset, refused, socket timeout, DNS)
    #[error("Network error ({kind}): {message}")]
    Network {
        /// Failure class
        kind: NetworkErrorKind,
        /// Error message describing the network issue
        message: String,
    },

    /// Non-success HTTP status from a remote dependency
    #[error("HTTP {status}: {message}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Error message from the remote side
        message: String,
    },

    /// The circuit breaker's hard per-call timeout fired
    #[error("Operation for '{service}' timed out after {timeout:?}")]
    Timeout {
        /// Service the call was made for
        service: String,
        /// Configured timeout
        timeout: Duration,
    },

    /// Circuit breaker is open; the operation was never invoked
    #[error("Circuit breaker for '{service}' is open")]
    CircuitOpen {
        /// Service whose breaker rejected the call
        service: String,
        /// Time left until the breaker will admit a trial call
        retry_after: Option<Duration>,
    },

    /// No token could be acquired within the allowed wait
    #[error("Rate limit exceeded for '{service}'")]
    RateLimitExceeded {
        /// Service whose limiter rejected the call
        service: String,
        /// Time until the requested tokens would be available
        retry_after: Option<Duration>,
    },

    /// All retry attempts failed; wraps the last underlying error
    #[error("Retries exhausted after {attempts} attempts ({total_delay:?} backoff): {source}")]
    RetryExhausted {
        /// Number of attempts made
        attempts: u32,
        /// Cumulative backoff slept between attempts
        total_delay: Duration,
        /// The last error observed
        #[source]
        source: Box<ResilienceError>,
    },

    /// Durable store failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message from the backend
        message: String,
    },

    /// Value could not be serialized or deserialized
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error message
        message: String,
    },

    /// Compression or decompression failed
    #[error("Compression error: {message}")]
    Compression {
        /// Error message
        message: String,
    },

    /// Invalid configuration
    #[error("Configuration error: {message}")]
    Configuration {
        /// Error message describing the configuration issue
        message: String,
    },

    /// Caller-defined failure that fits no other class
    #[error("Operation failed: {message}")]
    Operation {
        /// Error message
        message: String,
    },
}

impl ResilienceError {
    /// Creates a network error of the given kind
    pub fn network(kind: NetworkErrorKind, message: impl Into<String>) -> Self {
        ResilienceError::Network {
            kind,
            message: message.into(),
        }
    }

    /// Creates an HTTP status error
    pub fn http(status: u16, message: impl Into<String>) -> Self {
        ResilienceError::Http {
            status,
            message: message.into(),
        }
    }

    /// Creates a generic operation error
    pub fn operation(message: impl Into<String>) -> Self {
        ResilienceError::Operation {
            message: message.into(),
        }
    }

    /// Creates a storage error
    pub fn storage(message: impl Into<String>) -> Self {
        ResilienceError::Storage {
            message: message.into(),
        }
    }

    /// Creates a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        ResilienceError::Configuration {
            message: message.into(),
        }
    }

    /// Classifies this error.
    pub fn category(&self) -> ErrorCategory {
        match self {
            ResilienceError::Network { .. } | ResilienceError::Timeout { .. } => {
                ErrorCategory::Transient
            }
            ResilienceError::Http { status, .. } => {
                if (400..500).contains(status) && *status != 429 {
                    ErrorCategory::Permanent
                } else {
                    ErrorCategory::Transient
                }
            }
            ResilienceError::CircuitOpen { .. } => ErrorCategory::CircuitOpen,
            ResilienceError::RateLimitExceeded { .. } => ErrorCategory::RateLimitExceeded,
            ResilienceError::RetryExhausted { .. } => ErrorCategory::RetryExhausted,
            ResilienceError::Serialization { .. }
            | ResilienceError::Compression { .. }
            | ResilienceError::Configuration { .. } => ErrorCategory::Permanent,
            ResilienceError::Storage { .. } | ResilienceError::Operation { .. } => {
                ErrorCategory::Transient
            }
        }
    }

    /// Returns true if the default retry predicate would retry this error.
    ///
    /// Retried:
    /// - Connection reset, timeout and DNS failures
    /// - HTTP 429, 502, 503, 504
    /// - Anything not explicitly classified (other 5xx, storage and
    ///   operation errors, an open circuit)
    ///
    /// Not retried:
    /// - Any other 4xx
    /// - Local serialization, compression and configuration faults
    /// - An already exhausted retry
    pub fn is_retryable(&self) -> bool {
        match self {
            ResilienceError::Network { .. } | ResilienceError::Timeout { .. } => true,
            ResilienceError::Http { status, .. } => match status {
                429 | 502 | 503 | 504 => true,
                400..=499 => false,
                _ => true,
            },
            ResilienceError::RetryExhausted { .. } => false,
            ResilienceError::Serialization { .. }
            | ResilienceError::Compression { .. }
            | ResilienceError::Configuration { .. } => false,
            ResilienceError::CircuitOpen { .. }
            | ResilienceError::RateLimitExceeded { .. }
            | ResilienceError::Storage { .. }
            | ResilienceError::Operation { .. } => true,
        }
    }

    /// Returns the retry-after hint if the rejecting layer provided one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ResilienceError::CircuitOpen { retry_after, .. }
            | ResilienceError::RateLimitExceeded { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Returns the HTTP status, looking through a retry-exhausted wrapper.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            ResilienceError::Http { status, .. } => Some(*status),
            ResilienceError::RetryExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }

    /// Returns the innermost error, unwrapping a retry-exhausted wrapper.
    pub fn root_cause(&self) -> &ResilienceError {
        match self {
            ResilienceError::RetryExhausted { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ResilienceError {
    fn from(err: serde_json::Error) -> Self {
        ResilienceError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<std::io::Error> for ResilienceError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;

        let kind = match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted | ErrorKind::BrokenPipe => {
                NetworkErrorKind::ConnectionReset
            }
            ErrorKind::ConnectionRefused => NetworkErrorKind::ConnectionRefused,
            ErrorKind::TimedOut => NetworkErrorKind::Timeout,
            _ => NetworkErrorKind::Other,
        };
        ResilienceError::Network {
            kind,
            message: err.to_string(),
        }
    }
}

impl From<regex::Error> for ResilienceError {
    fn from(err: regex::Error) -> Self {
        ResilienceError::Configuration {
            message: format!("Invalid pattern: {}", err),
        }
    }
}
