//! Error types for the resilience and caching core.
//!
//! Every layer (rate limiter, circuit breaker, retry, caches) reports through
//! one typed error so callers can tell an outage apart from a bad request.

mod categories;
mod error;

pub use categories::{ErrorCategory, NetworkErrorKind};
pub use error::{ResilienceError, ResilienceResult};
