//! Configuration types for the resilience and caching core.
//!
//! Component configs (`CircuitBreakerConfig`, `RateLimiterConfig`,
//! `RetryConfig`, `MemoryCacheConfig`, `StorageCacheConfig`) live next to the
//! component; this module bundles them per service and for the whole process.
//! All durations serialize as integer milliseconds under `...Ms` keys.

use crate::cache::{MemoryCacheConfig, StorageCacheConfig};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::resilience::{CircuitBreakerConfig, RateLimiterConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Per-service bundle of breaker, limiter and retry settings.
///
/// A `None` layer is not applied for that service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceResilienceConfig {
    /// When false, calls to the service bypass every layer
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Circuit breaker thresholds
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    /// Token bucket rate
    #[serde(default)]
    pub rate_limiter: Option<RateLimiterConfig>,
    /// Retry policy
    #[serde(default)]
    pub retry: Option<RetryConfig>,
}

fn default_enabled() -> bool {
    true
}

impl Default for ServiceResilienceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            circuit_breaker: Some(CircuitBreakerConfig::default()),
            rate_limiter: None,
            retry: Some(RetryConfig::default()),
        }
    }
}

impl ServiceResilienceConfig {
    /// Creates a config with no layers; add them with the setters.
    pub fn new() -> Self {
        Self {
            enabled: true,
            circuit_breaker: None,
            rate_limiter: None,
            retry: None,
        }
    }

    /// A config that leaves the service unwrapped.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::new()
        }
    }

    /// Set circuit breaker configuration
    pub fn circuit_breaker(mut self, config: CircuitBreakerConfig) -> Self {
        self.circuit_breaker = Some(config);
        self
    }

    /// Set rate limiter configuration
    pub fn rate_limiter(mut self, config: RateLimiterConfig) -> Self {
        self.rate_limiter = Some(config);
        self
    }

    /// Set retry configuration
    pub fn retry(mut self, config: RetryConfig) -> Self {
        self.retry = Some(config);
        self
    }

    /// Enable or disable the service wrapping
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Settings for a slow speech-to-text / classification API: long call
    /// timeout, modest request rate, patient retries.
    pub fn transcription() -> Self {
        Self::new()
            .circuit_breaker(
                CircuitBreakerConfig::new()
                    .failure_threshold(5)
                    .success_threshold(2)
                    .timeout(Duration::from_secs(60))
                    .volume_threshold(5)
                    .error_threshold_percentage(50.0)
                    .reset_timeout(Duration::from_secs(60)),
            )
            .rate_limiter(RateLimiterConfig::new(50.0, Duration::from_secs(60)).max_burst_size(10))
            .retry(
                RetryConfig::new()
                    .max_attempts(3)
                    .initial_delay(Duration::from_secs(1))
                    .max_delay(Duration::from_secs(10))
                    .backoff_multiplier(2.0),
            )
    }

    /// Settings for a messaging gateway: short timeout, per-second rate.
    pub fn messaging() -> Self {
        Self::new()
            .circuit_breaker(
                CircuitBreakerConfig::new()
                    .failure_threshold(5)
                    .success_threshold(3)
                    .timeout(Duration::from_secs(10))
                    .volume_threshold(10)
                    .error_threshold_percentage(50.0)
                    .reset_timeout(Duration::from_secs(30)),
            )
            .rate_limiter(RateLimiterConfig::new(30.0, Duration::from_secs(1)))
            .retry(
                RetryConfig::new()
                    .max_attempts(3)
                    .initial_delay(Duration::from_millis(500))
                    .max_delay(Duration::from_secs(5))
                    .backoff_multiplier(2.0),
            )
    }

    /// Settings for the durable key-value store: fast timeout, quick
    /// recovery, no rate limit.
    pub fn storage() -> Self {
        Self::new()
            .circuit_breaker(
                CircuitBreakerConfig::new()
                    .failure_threshold(10)
                    .success_threshold(2)
                    .timeout(Duration::from_secs(5))
                    .volume_threshold(10)
                    .error_threshold_percentage(60.0)
                    .reset_timeout(Duration::from_secs(15)),
            )
            .retry(
                RetryConfig::new()
                    .max_attempts(4)
                    .initial_delay(Duration::from_millis(100))
                    .max_delay(Duration::from_secs(2))
                    .backoff_multiplier(2.0),
            )
    }

    /// Checks every configured layer.
    pub fn validate(&self) -> ResilienceResult<()> {
        if let Some(cb) = &self.circuit_breaker {
            cb.validate()?;
        }
        if let Some(rl) = &self.rate_limiter {
            rl.validate()?;
        }
        if let Some(retry) = &self.retry {
            retry.validate()?;
        }
        Ok(())
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CoreConfig {
    /// In-process cache settings
    #[serde(default)]
    pub memory_cache: MemoryCacheConfig,
    /// Storage cache settings
    #[serde(default)]
    pub storage_cache: StorageCacheConfig,
    /// Per-service resilience settings keyed by service name
    #[serde(default)]
    pub services: HashMap<String, ServiceResilienceConfig>,
}

impl CoreConfig {
    /// Parses and validates a JSON document.
    pub fn from_json(json: &str) -> ResilienceResult<Self> {
        let config: CoreConfig = serde_json::from_str(json).map_err(|e| {
            ResilienceError::configuration(format!("invalid configuration document: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Builds the cache sections from `RESILIENCE_*` environment variables.
    /// Services are not read from the environment.
    pub fn from_env() -> ResilienceResult<Self> {
        let config = Self {
            memory_cache: MemoryCacheConfig::from_env()?,
            storage_cache: StorageCacheConfig::from_env()?,
            services: HashMap::new(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    pub fn validate(&self) -> ResilienceResult<()> {
        self.memory_cache.validate()?;
        self.storage_cache.validate()?;
        for (name, service) in &self.services {
            service.validate().map_err(|e| {
                ResilienceError::configuration(format!("service '{}': {}", name, e))
            })?;
        }
        Ok(())
    }
}

/// Reads an optional environment variable and parses it.
pub(crate) fn env_parse<T: std::str::FromStr>(key: &str) -> ResilienceResult<Option<T>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ResilienceError::configuration(format!("{} has invalid value '{}'", key, raw))),
        Err(_) => Ok(None),
    }
}

/// Serde adapter storing a `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Serde adapter storing an `Option<Duration>` as optional milliseconds.
pub(crate) mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|v| v.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_service_config_from_json() {
        let json = r#"{
            "services": {
                "transcription": {
                    "circuitBreaker": {
                        "failureThreshold": 3,
                        "successThreshold": 2,
                        "timeoutMs": 10000,
                        "volumeThreshold": 3,
                        "errorThresholdPercentage": 50,
                        "resetTimeoutMs": 30000
                    },
                    "rateLimiter": { "tokensPerInterval": 10, "intervalMs": 1000 },
                    "retry": {
                        "maxAttempts": 3,
                        "initialDelayMs": 100,
                        "maxDelayMs": 2000,
                        "backoffMultiplier": 2.0
                    }
                },
                "legacy": { "enabled": false }
            }
        }"#;

        let config = CoreConfig::from_json(json).unwrap();
        let svc = &config.services["transcription"];
        assert!(svc.enabled);
        let cb = svc.circuit_breaker.as_ref().unwrap();
        assert_eq!(cb.failure_threshold, 3);
        assert_eq!(cb.reset_timeout, Duration::from_secs(30));
        let rl = svc.rate_limiter.as_ref().unwrap();
        assert_eq!(rl.max_tokens(), 10.0);
        assert_eq!(svc.retry.as_ref().unwrap().initial_delay, Duration::from_millis(100));

        let legacy = &config.services["legacy"];
        assert!(!legacy.enabled);
        assert!(legacy.circuit_breaker.is_none());
    }

    #[test]
    fn test_invalid_service_is_rejected() {
        let json = r#"{ "services": { "bad": { "retry": {
            "maxAttempts": 0, "initialDelayMs": 1, "maxDelayMs": 1, "backoffMultiplier": 2.0
        } } } }"#;
        let err = CoreConfig::from_json(json).unwrap_err();
        assert!(err.to_string().contains("bad"));
    }

    #[test]
    fn test_presets_validate() {
        for preset in [
            ServiceResilienceConfig::transcription(),
            ServiceResilienceConfig::messaging(),
            ServiceResilienceConfig::storage(),
            ServiceResilienceConfig::default(),
        ] {
            assert!(preset.validate().is_ok());
        }
        assert!(ServiceResilienceConfig::storage().rate_limiter.is_none());
    }

    #[test]
    fn test_round_trip_keeps_millisecond_keys() {
        let config = ServiceResilienceConfig::messaging();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["circuitBreaker"]["resetTimeoutMs"], 30000);
        assert_eq!(json["rateLimiter"]["intervalMs"], 1000);
    }
}
