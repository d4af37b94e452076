//! Error classification used by retry predicates and health reporting.

use std::fmt;

/// Coarse classification of a [`ResilienceError`](super::ResilienceError).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Network failure, timeout, 5xx or 429; eligible for retry
    Transient,
    /// Client error (4xx other than 429) or a local fault that will not heal
    Permanent,
    /// The circuit breaker rejected the call without invoking it
    CircuitOpen,
    /// No rate limit token could be obtained within the allowed wait
    RateLimitExceeded,
    /// All retry attempts failed
    RetryExhausted,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::Permanent => "permanent",
            ErrorCategory::CircuitOpen => "circuit_open",
            ErrorCategory::RateLimitExceeded => "rate_limit_exceeded",
            ErrorCategory::RetryExhausted => "retry_exhausted",
        };
        f.write_str(name)
    }
}

/// Low-level network failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkErrorKind {
    /// Peer reset the connection
    ConnectionReset,
    /// Peer refused the connection
    ConnectionRefused,
    /// Socket-level timeout
    Timeout,
    /// Name resolution failed
    Dns,
    /// Anything else at the transport layer
    Other,
}

impl fmt::Display for NetworkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkErrorKind::ConnectionReset => "connection reset",
            NetworkErrorKind::ConnectionRefused => "connection refused",
            NetworkErrorKind::Timeout => "timeout",
            NetworkErrorKind::Dns => "dns failure",
            NetworkErrorKind::Other => "network failure",
        };
        f.write_str(name)
    }
}
