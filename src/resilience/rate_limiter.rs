//! Rate limiter using the token bucket algorithm.

use crate::config::duration_ms;
use crate::errors::{ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

/// Shortest sleep between acquisition attempts while waiting.
const MIN_WAIT_STEP: Duration = Duration::from_millis(1);

/// Configuration for rate limiter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Tokens added per interval
    pub tokens_per_interval: f64,
    /// Refill interval
    #[serde(rename = "intervalMs", with = "duration_ms")]
    pub interval: Duration,
    /// Bucket capacity; defaults to `tokens_per_interval`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_burst_size: Option<u32>,
}

impl RateLimiterConfig {
    /// Create a configuration admitting `tokens_per_interval` per `interval`
    pub fn new(tokens_per_interval: f64, interval: Duration) -> Self {
        Self {
            tokens_per_interval,
            interval,
            max_burst_size: None,
        }
    }

    /// Rate expressed per second
    pub fn per_second(tokens: f64) -> Self {
        Self::new(tokens, Duration::from_secs(1))
    }

    /// Rate expressed per minute
    pub fn per_minute(tokens: f64) -> Self {
        Self::new(tokens, Duration::from_secs(60))
    }

    /// Set bucket capacity
    pub fn max_burst_size(mut self, n: u32) -> Self {
        self.max_burst_size = Some(n);
        self
    }

    /// Bucket capacity
    pub fn max_tokens(&self) -> f64 {
        self.max_burst_size
            .map(f64::from)
            .unwrap_or(self.tokens_per_interval)
    }

    /// Tokens added per second
    pub fn refill_rate(&self) -> f64 {
        self.tokens_per_interval / self.interval.as_secs_f64()
    }

    /// Checks the rate is usable.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.tokens_per_interval.is_nan() || self.tokens_per_interval <= 0.0 {
            return Err(ResilienceError::configuration("tokensPerInterval must be positive"));
        }
        if self.interval.is_zero() {
            return Err(ResilienceError::configuration("intervalMs must be positive"));
        }
        if self.max_burst_size == Some(0) {
            return Err(ResilienceError::configuration("maxBurstSize must be at least 1"));
        }
        Ok(())
    }
}

/// Point-in-time view of a limiter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    /// Tokens currently in the bucket
    pub available_tokens: f64,
    /// Bucket capacity
    pub max_tokens: f64,
    /// Tokens added per second
    pub refill_rate: f64,
    /// Acquisitions granted
    pub accepted: u64,
    /// Acquisitions refused
    pub rejected: u64,
}

/// Token bucket state
struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: Instant,
    accepted: u64,
    rejected: u64,
}

impl TokenBucket {
    fn new(config: &RateLimiterConfig) -> Self {
        let max_tokens = config.max_tokens();
        Self {
            tokens: max_tokens,
            max_tokens,
            refill_rate: config.refill_rate(),
            last_refill: Instant::now(),
            accepted: 0,
            rejected: 0,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
    }

    fn try_consume(&mut self, count: f64) -> bool {
        self.refill();
        if self.tokens >= count {
            self.tokens -= count;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self, count: f64) -> Duration {
        self.refill();
        if self.tokens >= count {
            return Duration::ZERO;
        }
        let needed = count - self.tokens;
        Duration::from_secs_f64(needed / self.refill_rate)
    }
}

/// Token bucket guarding one named dependency.
///
/// The bucket starts full and refills continuously; an acquisition either
/// takes all requested tokens or none.
pub struct RateLimiter {
    service: String,
    config: RateLimiterConfig,
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Create a new rate limiter for `service`
    pub fn new(service: impl Into<String>, config: RateLimiterConfig) -> Self {
        Self {
            service: service.into(),
            bucket: Mutex::new(TokenBucket::new(&config)),
            config,
        }
    }

    /// Name of the guarded service
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Limiter configuration
    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Takes `tokens` if all are available; never waits.
    pub fn try_acquire(&self, tokens: u32) -> bool {
        let mut bucket = self.bucket.lock();
        let granted = tokens as f64 <= bucket.max_tokens && bucket.try_consume(tokens as f64);
        if granted {
            bucket.accepted += 1;
        } else {
            bucket.rejected += 1;
        }
        granted
    }

    /// Like [`try_acquire`](Self::try_acquire) but reports a typed error
    /// with the time until the tokens would be available.
    pub fn acquire(&self, tokens: u32) -> ResilienceResult<()> {
        if self.try_acquire(tokens) {
            Ok(())
        } else {
            Err(self.exceeded(tokens))
        }
    }

    /// Waits up to `max_wait` for `tokens`.
    ///
    /// Returns false without waiting when `tokens` exceeds the bucket
    /// capacity, and false once the wait budget is spent.
    pub async fn acquire_or_wait(&self, tokens: u32, max_wait: Duration) -> bool {
        let count = tokens as f64;
        if count > self.config.max_tokens() {
            warn!(
                service = %self.service,
                tokens,
                max_tokens = self.config.max_tokens(),
                "Requested more tokens than the bucket can hold"
            );
            self.bucket.lock().rejected += 1;
            return false;
        }

        // A budget too large to represent as an instant waits without limit.
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                if bucket.try_consume(count) {
                    bucket.accepted += 1;
                    return true;
                }
                bucket.time_until_available(count)
            };

            let mut step = wait.max(MIN_WAIT_STEP);
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    self.bucket.lock().rejected += 1;
                    return false;
                }
                step = step.min(deadline - now);
            }
            debug!(
                service = %self.service,
                tokens,
                wait_ms = step.as_millis() as u64,
                "Waiting for rate limit tokens"
            );
            sleep(step).await;
        }
    }

    /// Acquires `tokens` (waiting up to `max_wait`), then runs `operation`.
    ///
    /// The tokens are refunded if the operation fails: the limiter bounds
    /// call volume, not success.
    pub async fn execute_with_rate_limit<F, Fut, T>(
        &self,
        tokens: u32,
        max_wait: Duration,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        if !self.acquire_or_wait(tokens, max_wait).await {
            return Err(self.exceeded(tokens));
        }

        let result = operation().await;
        if result.is_err() {
            self.refund(tokens);
        }
        result
    }

    /// Returns tokens to the bucket, capped at capacity
    pub fn refund(&self, tokens: u32) {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens = (bucket.tokens + tokens as f64).min(bucket.max_tokens);
    }

    /// Tokens currently available
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        bucket.tokens
    }

    /// Time until `tokens` would be available; `None` if they never can be
    pub fn time_until_available(&self, tokens: u32) -> Option<Duration> {
        let mut bucket = self.bucket.lock();
        if tokens as f64 > bucket.max_tokens {
            return None;
        }
        Some(bucket.time_until_available(tokens as f64))
    }

    /// True when not even a single token is available
    pub fn is_exhausted(&self) -> bool {
        self.available_tokens() < 1.0
    }

    /// Snapshot of the limiter
    pub fn stats(&self) -> RateLimiterStats {
        let mut bucket = self.bucket.lock();
        bucket.refill();
        RateLimiterStats {
            available_tokens: bucket.tokens,
            max_tokens: bucket.max_tokens,
            refill_rate: bucket.refill_rate,
            accepted: bucket.accepted,
            rejected: bucket.rejected,
        }
    }

    /// Refill the bucket and clear the counters
    pub fn reset(&self) {
        *self.bucket.lock() = TokenBucket::new(&self.config);
        debug!(service = %self.service, "Rate limiter reset");
    }

    fn exceeded(&self, tokens: u32) -> ResilienceError {
        ResilienceError::RateLimitExceeded {
            service: self.service.clone(),
            retry_after: self.time_until_available(tokens),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn limiter(tokens: f64, interval_ms: u64) -> RateLimiter {
        RateLimiter::new(
            "svc",
            RateLimiterConfig::new(tokens, Duration::from_millis(interval_ms)),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_admits_burst_then_refills() {
        let rl = limiter(10.0, 1000);

        for _ in 0..10 {
            assert!(rl.try_acquire(1));
        }
        assert!(!rl.try_acquire(1));

        tokio::time::advance(Duration::from_millis(1000)).await;

        for _ in 0..10 {
            assert!(rl.try_acquire(1));
        }
        assert!(!rl.try_acquire(1));

        let stats = rl.stats();
        assert_eq!(stats.accepted, 20);
        assert_eq!(stats.rejected, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_partial_deduction() {
        let rl = limiter(5.0, 1000);
        assert!(rl.try_acquire(3));
        assert!(!rl.try_acquire(3));
        assert_eq!(rl.available_tokens(), 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokens_never_exceed_burst() {
        let rl = RateLimiter::new(
            "svc",
            RateLimiterConfig::new(10.0, Duration::from_secs(1)).max_burst_size(4),
        );
        assert_eq!(rl.available_tokens(), 4.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(rl.available_tokens(), 4.0);

        rl.refund(10);
        assert_eq!(rl.available_tokens(), 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_request_above_capacity_always_fails() {
        let rl = limiter(5.0, 1000);
        assert!(!rl.try_acquire(6));
        assert!(!rl.acquire_or_wait(6, Duration::from_secs(60)).await);
        assert_eq!(rl.time_until_available(6), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_or_wait_waits_for_refill() {
        let rl = limiter(10.0, 1000);
        assert!(rl.try_acquire(10));

        let start = Instant::now();
        assert!(rl.acquire_or_wait(1, Duration::from_secs(1)).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(100));
        assert!(waited < Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_or_wait_unbounded_budget() {
        let rl = limiter(10.0, 1000);
        assert!(rl.try_acquire(10));

        let start = Instant::now();
        assert!(rl.acquire_or_wait(1, Duration::MAX).await);
        assert!(start.elapsed() < Duration::from_millis(200));
        assert_eq!(rl.stats().rejected, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_or_wait_gives_up_after_budget() {
        let rl = limiter(1.0, 10_000);
        assert!(rl.try_acquire(1));

        let start = Instant::now();
        assert!(!rl.acquire_or_wait(1, Duration::from_millis(500)).await);
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_reports_retry_after() {
        let rl = limiter(2.0, 1000);
        rl.acquire(2).unwrap();

        match rl.acquire(1) {
            Err(ResilienceError::RateLimitExceeded { retry_after, .. }) => {
                let retry_after = retry_after.unwrap();
                assert!(retry_after > Duration::ZERO);
                assert!(retry_after <= Duration::from_millis(500));
            }
            other => panic!("expected rate limit error, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_refunds_on_failure() {
        let rl = limiter(1.0, 60_000);

        let result: ResilienceResult<()> = rl
            .execute_with_rate_limit(1, Duration::ZERO, || async {
                Err(ResilienceError::http(503, "down"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(rl.available_tokens(), 1.0);

        let result = rl
            .execute_with_rate_limit(1, Duration::ZERO, || async { Ok(1) })
            .await;
        assert_eq!(result.unwrap(), 1);
        assert!(rl.is_exhausted());
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_rejects_without_invoking() {
        let rl = limiter(1.0, 60_000);
        assert!(rl.try_acquire(1));

        let invoked = AtomicU32::new(0);
        let result = rl
            .execute_with_rate_limit(1, Duration::ZERO, || async {
                invoked.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(ResilienceError::RateLimitExceeded { .. })));
        assert_eq!(invoked.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_refills_bucket() {
        let rl = limiter(3.0, 60_000);
        assert!(rl.try_acquire(3));
        assert!(rl.is_exhausted());

        rl.reset();
        assert_eq!(rl.available_tokens(), 3.0);
        assert_eq!(rl.stats().accepted, 0);
    }

    #[test]
    fn test_config_defaults_burst_to_rate() {
        let config = RateLimiterConfig::per_minute(20.0);
        assert_eq!(config.max_tokens(), 20.0);
        assert!((config.refill_rate() - 20.0 / 60.0).abs() < f64::EPSILON);
        assert!(RateLimiterConfig::per_second(0.0).validate().is_err());
    }
}
