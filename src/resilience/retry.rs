//! Retry logic with exponential backoff for transient failures.

use crate::config::duration_ms;
use crate::errors::{ResilienceError, ResilienceResult};
use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Lower and upper bound of the random factor applied by
/// [`RetryHandler::execute_with_jitter`].
pub const JITTER_RANGE: (f64, f64) = (0.8, 1.2);

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Total attempts including the first call
    pub max_attempts: u32,
    /// Delay before the second attempt
    #[serde(rename = "initialDelayMs", with = "duration_ms")]
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    #[serde(rename = "maxDelayMs", with = "duration_ms")]
    pub max_delay: Duration,
    /// Growth factor applied per attempt
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Create a new retry configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set maximum attempts
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, m: f64) -> Self {
        self.backoff_multiplier = m;
        self
    }

    /// Delay slept after failed attempt number `attempt` (1-based):
    /// `min(initial_delay * multiplier^(attempt-1), max_delay)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_nanos() as f64
            * self
                .backoff_multiplier
                .powi(attempt.saturating_sub(1) as i32);
        let capped = base.min(self.max_delay.as_nanos() as f64);
        Duration::from_nanos(capped as u64)
    }

    /// Copy with both delays scaled by `factor`.
    fn scaled(&self, factor: f64) -> Self {
        Self {
            initial_delay: scale_saturating(self.initial_delay, factor),
            max_delay: scale_saturating(self.max_delay, factor),
            ..self.clone()
        }
    }

    /// Checks the policy is usable.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_attempts == 0 {
            return Err(ResilienceError::configuration("maxAttempts must be at least 1"));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier <= 1.0 {
            return Err(ResilienceError::configuration(
                "backoffMultiplier must be greater than 1",
            ));
        }
        if self.max_delay < self.initial_delay {
            return Err(ResilienceError::configuration(
                "maxDelayMs must not be below initialDelayMs",
            ));
        }
        Ok(())
    }
}

/// `duration * factor`, clamped to `Duration::MAX`.
fn scale_saturating(duration: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(duration.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// Decides whether a failed attempt should be retried.
pub trait RetryPredicate: Send + Sync {
    /// `attempt` is the 1-based number of the attempt that failed.
    fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool;
}

/// Retries whatever [`ResilienceError::is_retryable`] classifies as
/// retryable.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPredicate;

impl RetryPredicate for DefaultRetryPredicate {
    fn should_retry(&self, error: &ResilienceError, _attempt: u32) -> bool {
        error.is_retryable()
    }
}

impl<F> RetryPredicate for F
where
    F: Fn(&ResilienceError, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, error: &ResilienceError, attempt: u32) -> bool {
        self(error, attempt)
    }
}

/// Hook for custom retry behavior
#[async_trait]
pub trait RetryHook: Send + Sync {
    /// Called after a failed attempt, before sleeping.
    async fn on_retry(&self, context: RetryContext) -> RetryDecision;
}

/// Context information for a retry attempt
#[derive(Debug, Clone)]
pub struct RetryContext {
    /// Attempt that just failed (1-based)
    pub attempt: u32,
    /// The error it failed with
    pub error: ResilienceError,
    /// Delay about to be slept
    pub delay: Duration,
    /// Backoff slept so far
    pub total_delay: Duration,
}

/// Decision on how to proceed with a retry
#[derive(Debug)]
pub enum RetryDecision {
    /// Use the computed delay
    Default,
    /// Retry after a custom delay
    Retry(Duration),
    /// Stop and return the error
    Abort,
}

/// Result of a retried operation with diagnostics.
#[derive(Debug)]
pub struct RetryOutcome<T> {
    /// Value of the successful attempt, or the last error
    pub result: ResilienceResult<T>,
    /// Attempts made
    pub attempts: u32,
    /// Cumulative backoff slept
    pub total_delay: Duration,
    /// True when the attempts ran out on a retryable error
    pub exhausted: bool,
}

impl<T> RetryOutcome<T> {
    /// True if an attempt succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Converts to a plain result. A failure that ran out of attempts becomes
    /// [`ResilienceError::RetryExhausted`]; an error the predicate refused to
    /// retry is returned unchanged.
    pub fn into_result(self) -> ResilienceResult<T> {
        match self.result {
            Err(error) if self.exhausted => Err(ResilienceError::RetryExhausted {
                attempts: self.attempts,
                total_delay: self.total_delay,
                source: Box::new(error),
            }),
            other => other,
        }
    }
}

/// Runs an operation up to `max_attempts` times with exponential backoff.
#[derive(Clone)]
pub struct RetryHandler {
    config: RetryConfig,
    predicate: Arc<dyn RetryPredicate>,
    hook: Option<Arc<dyn RetryHook>>,
}

impl RetryHandler {
    /// Create a handler using the default predicate
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            predicate: Arc::new(DefaultRetryPredicate),
            hook: None,
        }
    }

    /// Replace the retry predicate
    pub fn with_predicate(mut self, predicate: Arc<dyn RetryPredicate>) -> Self {
        self.predicate = predicate;
        self
    }

    /// Add a hook called before each backoff sleep
    pub fn with_hook(mut self, hook: Arc<dyn RetryHook>) -> Self {
        self.hook = Some(hook);
        self
    }

    /// Retry configuration
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Execute the operation with the configured backoff.
    pub async fn execute<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.run(&self.config, operation).await
    }

    /// Execute with both delays scaled by a random factor in
    /// [`JITTER_RANGE`], so many callers failing together do not retry in
    /// lockstep.
    pub async fn execute_with_jitter<F, Fut, T>(&self, operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let factor = rand::thread_rng().gen_range(JITTER_RANGE.0..=JITTER_RANGE.1);
        let config = self.config.scaled(factor);
        self.run(&config, operation).await
    }

    async fn run<F, Fut, T>(&self, config: &RetryConfig, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let max_attempts = config.max_attempts.max(1);
        let mut total_delay = Duration::ZERO;
        let mut attempt = 0;

        loop {
            attempt += 1;

            let error = match operation().await {
                Ok(value) => {
                    if attempt > 1 {
                        debug!(attempt, "Operation succeeded after retry");
                    }
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                        total_delay,
                        exhausted: false,
                    };
                }
                Err(error) => error,
            };

            if !self.predicate.should_retry(&error, attempt) {
                debug!(attempt, error = %error, "Error is not retryable");
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    total_delay,
                    exhausted: false,
                };
            }

            if attempt >= max_attempts {
                warn!(attempt, error = %error, "Retry attempts exhausted");
                return RetryOutcome {
                    result: Err(error),
                    attempts: attempt,
                    total_delay,
                    exhausted: true,
                };
            }

            let mut delay = config.delay_for_attempt(attempt);
            if let Some(hook) = &self.hook {
                let context = RetryContext {
                    attempt,
                    error: error.clone(),
                    delay,
                    total_delay,
                };
                match hook.on_retry(context).await {
                    RetryDecision::Default => {}
                    RetryDecision::Retry(custom) => delay = custom,
                    RetryDecision::Abort => {
                        debug!(attempt, "Retry aborted by hook");
                        return RetryOutcome {
                            result: Err(error),
                            attempts: attempt,
                            total_delay,
                            exhausted: false,
                        };
                    }
                }
            }

            debug!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Retrying operation"
            );
            sleep(delay).await;
            total_delay = total_delay.saturating_add(delay);
        }
    }
}
