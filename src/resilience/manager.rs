use crate::config::{CoreConfig, ServiceResilienceConfig};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::CircuitStateObserver;
use crate::resilience::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitState};
use crate::resilience::rate_limiter::{RateLimiter, RateLimiterStats};
use crate::resilience::retry::{RetryHandler, RetryOutcome, RetryPredicate};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Per-call overrides for [`ResilienceManager::execute_with_options`].
#[derive(Debug, Clone, Copy)]
pub struct ExecuteOptions {
    /// Do not consume rate limiter tokens
    pub skip_rate_limit: bool,
    /// Bypass the circuit breaker
    pub skip_circuit_breaker: bool,
    /// Make a single attempt
    pub skip_retry: bool,
    /// Tokens taken from the service's bucket
    pub tokens: u32,
    /// How long to wait for tokens before failing with `RateLimitExceeded`
    pub rate_limit_wait: Duration,
    /// Apply random jitter to the retry delays
    pub jitter: bool,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            skip_rate_limit: false,
            skip_circuit_breaker: false,
            skip_retry: false,
            tokens: 1,
            rate_limit_wait: Duration::ZERO,
            jitter: true,
        }
    }
}

impl ExecuteOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the rate limiter
    pub fn skip_rate_limit(mut self) -> Self {
        self.skip_rate_limit = true;
        self
    }

    /// Skip the circuit breaker
    pub fn skip_circuit_breaker(mut self) -> Self {
        self.skip_circuit_breaker = true;
        self
    }

    /// Skip retries
    pub fn skip_retry(mut self) -> Self {
        self.skip_retry = true;
        self
    }

    /// Set the token cost of the call
    pub fn tokens(mut self, tokens: u32) -> Self {
        self.tokens = tokens;
        self
    }

    /// Set the rate limit wait budget
    pub fn rate_limit_wait(mut self, wait: Duration) -> Self {
        self.rate_limit_wait = wait;
        self
    }

    /// Enable or disable retry jitter
    pub fn jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }
}

/// Retry counters for one service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RetryStats {
    /// Attempts made across all calls
    pub total_attempts: u64,
    /// Calls that succeeded on a later attempt
    pub successful_after_retry: u64,
    /// Calls that failed after more than one attempt
    pub failed_after_retries: u64,
}

/// Combined view of a service's resilience state.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ServiceStats {
    /// Breaker state, if the service has a breaker
    pub circuit_state: Option<CircuitState>,
    /// Breaker counters
    pub circuit_breaker: Option<CircuitBreakerStats>,
    /// Limiter counters
    pub rate_limiter: Option<RateLimiterStats>,
    /// Retry counters
    pub retry: RetryStats,
}

/// Registry of per-service breakers, limiters and retry policies.
///
/// Calls for a service pass through the rate limiter, then the circuit
/// breaker, then the retry loop. A service with no configuration, or one
/// configured as disabled, is called directly.
pub struct ResilienceManager {
    configs: RwLock<HashMap<String, ServiceResilienceConfig>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    limiters: RwLock<HashMap<String, Arc<RateLimiter>>>,
    retry_stats: Mutex<HashMap<String, RetryStats>>,
    observer: Option<Arc<dyn CircuitStateObserver>>,
    retry_predicate: Option<Arc<dyn RetryPredicate>>,
}

impl Default for ResilienceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResilienceManager {
    /// Create a manager with no services
    pub fn new() -> Self {
        Self {
            configs: RwLock::new(HashMap::new()),
            breakers: RwLock::new(HashMap::new()),
            limiters: RwLock::new(HashMap::new()),
            retry_stats: Mutex::new(HashMap::new()),
            observer: None,
            retry_predicate: None,
        }
    }

    /// Create a builder
    pub fn builder() -> ResilienceManagerBuilder {
        ResilienceManagerBuilder::new()
    }

    /// Create a manager with every service from `config`
    pub fn from_config(config: &CoreConfig) -> ResilienceResult<Self> {
        Self::builder()
            .services(config.services.clone())
            .build()
    }

    /// Store the configuration for `service` and create its breaker and
    /// limiter. Reconfiguring a service replaces their state.
    pub fn configure_service(
        &self,
        service: impl Into<String>,
        config: ServiceResilienceConfig,
    ) -> ResilienceResult<()> {
        let service = service.into();
        config.validate().map_err(|e| {
            ResilienceError::configuration(format!("service '{}': {}", service, e))
        })?;

        {
            let mut breakers = self.breakers.write();
            match &config.circuit_breaker {
                Some(cb) => {
                    let mut breaker = CircuitBreaker::new(service.clone(), cb.clone());
                    if let Some(observer) = &self.observer {
                        breaker = breaker.with_observer(observer.clone());
                    }
                    breakers.insert(service.clone(), Arc::new(breaker));
                }
                None => {
                    breakers.remove(&service);
                }
            }
        }

        {
            let mut limiters = self.limiters.write();
            match &config.rate_limiter {
                Some(rl) => {
                    limiters.insert(
                        service.clone(),
                        Arc::new(RateLimiter::new(service.clone(), rl.clone())),
                    );
                }
                None => {
                    limiters.remove(&service);
                }
            }
        }

        info!(
            service = %service,
            enabled = config.enabled,
            circuit_breaker = config.circuit_breaker.is_some(),
            rate_limiter = config.rate_limiter.is_some(),
            retry = config.retry.is_some(),
            "Configured service resilience"
        );
        self.configs.write().insert(service, config);
        Ok(())
    }

    /// Forget a service entirely. Returns false if it was not configured.
    pub fn remove_service(&self, service: &str) -> bool {
        self.breakers.write().remove(service);
        self.limiters.write().remove(service);
        self.retry_stats.lock().remove(service);
        self.configs.write().remove(service).is_some()
    }

    /// Configuration of a service
    pub fn service_config(&self, service: &str) -> Option<ServiceResilienceConfig> {
        self.configs.read().get(service).cloned()
    }

    /// Names of configured services, sorted
    pub fn services(&self) -> Vec<String> {
        let mut names: Vec<String> = self.configs.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Breaker of a service
    pub fn circuit_breaker(&self, service: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(service).cloned()
    }

    /// Limiter of a service
    pub fn rate_limiter(&self, service: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.read().get(service).cloned()
    }

    /// Execute `operation` through the layers configured for `service`.
    pub async fn execute_with_resilience<F, Fut, T>(
        &self,
        service: &str,
        operation: F,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.execute_with_options(service, operation, ExecuteOptions::default())
            .await
    }

    /// Execute `operation` with per-call overrides.
    #[instrument(skip_all, fields(service = %service))]
    pub async fn execute_with_options<F, Fut, T>(
        &self,
        service: &str,
        operation: F,
        options: ExecuteOptions,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let config = match self.service_config(service) {
            Some(config) if config.enabled => config,
            Some(_) => {
                debug!("Resilience disabled for service, calling directly");
                return operation().await;
            }
            None => {
                debug!("No resilience configured for service, calling directly");
                return operation().await;
            }
        };

        let limiter = if options.skip_rate_limit {
            None
        } else {
            self.rate_limiter(service)
        };
        let breaker = if options.skip_circuit_breaker {
            None
        } else {
            self.circuit_breaker(service)
        };
        let retry = match (&config.retry, options.skip_retry) {
            (Some(retry), false) => Some(self.retry_handler(retry.clone())),
            _ => None,
        };

        let guarded = || {
            self.run_guarded(
                service,
                breaker.as_deref(),
                retry.as_ref(),
                options.jitter,
                &operation,
            )
        };

        match limiter {
            Some(limiter) => {
                limiter
                    .execute_with_rate_limit(options.tokens, options.rate_limit_wait, guarded)
                    .await
            }
            None => guarded().await,
        }
    }

    async fn run_guarded<F, Fut, T>(
        &self,
        service: &str,
        breaker: Option<&CircuitBreaker>,
        retry: Option<&RetryHandler>,
        jitter: bool,
        operation: &F,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let retried = || self.run_retry(service, retry, jitter, operation);
        match breaker {
            Some(breaker) => breaker.execute(retried).await,
            None => retried().await,
        }
    }

    async fn run_retry<F, Fut, T>(
        &self,
        service: &str,
        retry: Option<&RetryHandler>,
        jitter: bool,
        operation: &F,
    ) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        let Some(handler) = retry else {
            return operation().await;
        };

        let outcome = if jitter {
            handler.execute_with_jitter(operation).await
        } else {
            handler.execute(operation).await
        };
        self.record_retry(service, &outcome);
        outcome.into_result()
    }

    fn retry_handler(&self, config: crate::resilience::RetryConfig) -> RetryHandler {
        let handler = RetryHandler::new(config);
        match &self.retry_predicate {
            Some(predicate) => handler.with_predicate(predicate.clone()),
            None => handler,
        }
    }

    fn record_retry<T>(&self, service: &str, outcome: &RetryOutcome<T>) {
        let mut all = self.retry_stats.lock();
        let stats = all.entry(service.to_string()).or_default();
        stats.total_attempts += u64::from(outcome.attempts);
        if outcome.attempts > 1 {
            if outcome.is_success() {
                stats.successful_after_retry += 1;
            } else {
                stats.failed_after_retries += 1;
            }
        }
    }

    /// False while the breaker is open or the bucket is empty. Services
    /// without configuration are reported healthy.
    pub fn is_service_healthy(&self, service: &str) -> bool {
        if let Some(breaker) = self.circuit_breaker(service) {
            if breaker.state() == CircuitState::Open {
                return false;
            }
        }
        if let Some(limiter) = self.rate_limiter(service) {
            if limiter.is_exhausted() {
                return false;
            }
        }
        true
    }

    /// Retry counters of a service
    pub fn retry_stats(&self, service: &str) -> RetryStats {
        self.retry_stats
            .lock()
            .get(service)
            .copied()
            .unwrap_or_default()
    }

    /// Combined statistics, `None` for services that are not configured
    pub fn stats(&self, service: &str) -> Option<ServiceStats> {
        if !self.configs.read().contains_key(service) {
            return None;
        }
        let breaker = self.circuit_breaker(service);
        let limiter = self.rate_limiter(service);
        Some(ServiceStats {
            circuit_state: breaker.as_ref().map(|b| b.state()),
            circuit_breaker: breaker.as_ref().map(|b| b.stats()),
            rate_limiter: limiter.as_ref().map(|l| l.stats()),
            retry: self.retry_stats(service),
        })
    }

    /// Statistics of every configured service
    pub fn all_stats(&self) -> HashMap<String, ServiceStats> {
        self.services()
            .into_iter()
            .filter_map(|name| self.stats(&name).map(|stats| (name, stats)))
            .collect()
    }

    /// Close the breaker, refill the bucket and drop the retry counters of
    /// `service`.
    pub fn reset_service(&self, service: &str) {
        if let Some(breaker) = self.circuit_breaker(service) {
            breaker.reset();
        }
        if let Some(limiter) = self.rate_limiter(service) {
            limiter.reset();
        }
        self.retry_stats.lock().remove(service);
        info!(service = %service, "Reset service resilience state");
    }

    /// [`reset_service`](Self::reset_service) for every service
    pub fn reset_all(&self) {
        for service in self.services() {
            self.reset_service(&service);
        }
    }
}

impl std::fmt::Debug for ResilienceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceManager")
            .field("services", &self.services())
            .field("has_observer", &self.observer.is_some())
            .finish()
    }
}

/// Builder for [`ResilienceManager`]
#[derive(Default)]
pub struct ResilienceManagerBuilder {
    observer: Option<Arc<dyn CircuitStateObserver>>,
    retry_predicate: Option<Arc<dyn RetryPredicate>>,
    services: Vec<(String, ServiceResilienceConfig)>,
}

impl ResilienceManagerBuilder {
    /// Create a new builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Observer attached to every breaker
    pub fn observer(mut self, observer: Arc<dyn CircuitStateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Predicate used by every retry loop
    pub fn retry_predicate(mut self, predicate: Arc<dyn RetryPredicate>) -> Self {
        self.retry_predicate = Some(predicate);
        self
    }

    /// Add a service
    pub fn service(mut self, name: impl Into<String>, config: ServiceResilienceConfig) -> Self {
        self.services.push((name.into(), config));
        self
    }

    /// Add several services
    pub fn services<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = (S, ServiceResilienceConfig)>,
        S: Into<String>,
    {
        self.services
            .extend(services.into_iter().map(|(name, config)| (name.into(), config)));
        self
    }

    /// Build the manager, validating every service
    pub fn build(self) -> ResilienceResult<ResilienceManager> {
        let manager = ResilienceManager {
            observer: self.observer,
            retry_predicate: self.retry_predicate,
            ..ResilienceManager::new()
        };
        for (name, config) in self.services {
            manager.configure_service(name, config)?;
        }
        Ok(manager)
    }
}
