//! # Integrations Resilience
//!
//! Shared infrastructure for outbound calls to unreliable dependencies.
//!
//! ## Features
//!
//! - Per-service circuit breakers with a rolling 60 second error window
//! - Token bucket rate limiting with bounded waits
//! - Retry with capped exponential backoff, jitter and pluggable predicates
//! - `ResilienceManager` composing rate limiter, breaker and retry per service
//! - Scoped in-process cache with TTL and hit-weighted eviction
//! - Storage cache with zstd compression and batched writes
//! - Structured logging through `tracing`
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use integrations_resilience::{ResilienceManager, ResilienceError, ServiceResilienceConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), ResilienceError> {
//!     let manager = ResilienceManager::builder()
//!         .service("transcription", ServiceResilienceConfig::transcription())
//!         .build()?;
//!
//!     let text = manager
//!         .execute_with_resilience("transcription", || async {
//!             Ok::<_, ResilienceError>("hello".to_string())
//!         })
//!         .await?;
//!     println!("{}", text);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - `resilience` - Circuit breaker, rate limiter, retry and the manager
//! - `cache` - Memory cache, content-hash memoization and storage cache
//! - `config` - Per-service and process-wide configuration
//! - `errors` - Error types and taxonomy
//! - `observability` - Logging setup and circuit state observers

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod config;
pub mod errors;
pub mod observability;
pub mod resilience;

#[cfg(test)]
pub mod mocks;

pub use cache::{
    CacheOptions, CacheScope, ContentHashCache, DurableStore, FlushReport, InMemoryStore,
    MemoryCache, MemoryCacheConfig, MemoryCacheStats, StorageCache, StorageCacheConfig,
    StorageMetrics,
};
pub use config::{CoreConfig, ServiceResilienceConfig};
pub use errors::{ErrorCategory, NetworkErrorKind, ResilienceError, ResilienceResult};
pub use observability::{
    CircuitStateObserver, CompositeObserver, LogFormat, LogLevel, LoggingConfig, TracingObserver,
};
pub use resilience::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, ExecuteOptions,
    RateLimiter, RateLimiterConfig, RateLimiterStats, ResilienceManager, RetryConfig,
    RetryHandler, RetryOutcome, RetryPredicate, RetryStats, ServiceStats,
};
