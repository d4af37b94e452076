//! Resilience layers for outbound calls: circuit breaker, token bucket rate
//! limiter, retry with exponential backoff, and the per-service manager that
//! composes them.

mod circuit_breaker;
mod manager;
mod rate_limiter;
mod retry;

#[cfg(test)]
mod tests;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, ROLLING_WINDOW,
};
pub use manager::{
    ExecuteOptions, ResilienceManager, ResilienceManagerBuilder, RetryStats, ServiceStats,
};
pub use rate_limiter::{RateLimiter, RateLimiterConfig, RateLimiterStats};
pub use retry::{
    DefaultRetryPredicate, RetryConfig, RetryContext, RetryDecision, RetryHandler, RetryHook,
    RetryOutcome, RetryPredicate, JITTER_RANGE,
};
