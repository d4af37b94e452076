//! Integration tests for the composed resilience layers

use super::*;
use crate::config::{CoreConfig, ServiceResilienceConfig};
use crate::errors::{NetworkErrorKind, ResilienceError};
use crate::mocks::RecordingObserver;
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn service_config() -> ServiceResilienceConfig {
    ServiceResilienceConfig::new()
        .circuit_breaker(
            CircuitBreakerConfig::new()
                .failure_threshold(2)
                .success_threshold(1)
                .volume_threshold(2)
                .timeout(Duration::from_secs(5))
                .reset_timeout(Duration::from_secs(10)),
        )
        .rate_limiter(RateLimiterConfig::per_second(100.0))
        .retry(
            RetryConfig::new()
                .max_attempts(3)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(100)),
        )
}

fn no_jitter() -> ExecuteOptions {
    ExecuteOptions::new().jitter(false)
}

fn unavailable() -> ResilienceError {
    ResilienceError::http(503, "service unavailable")
}

#[tokio::test(start_paused = true)]
async fn test_full_resilience_stack_success() {
    let manager = ResilienceManager::builder()
        .service("transcription", service_config())
        .build()
        .unwrap();

    let result = manager
        .execute_with_resilience("transcription", || async { Ok("success") })
        .await;

    assert_eq!(result.unwrap(), "success");
    let stats = manager.stats("transcription").unwrap();
    assert_eq!(stats.circuit_state, Some(CircuitState::Closed));
    assert_eq!(stats.retry.total_attempts, 1);
    assert_eq!(stats.rate_limiter.unwrap().accepted, 1);
}

#[tokio::test]
async fn test_unconfigured_service_fails_open() {
    let manager = ResilienceManager::new();
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = attempt_count.clone();

    let result: Result<(), _> = manager
        .execute_with_resilience("unknown", move || {
            let count = attempt_count_clone.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

    // Called once, with no retry and no wrapping of the error
    assert!(matches!(result, Err(ResilienceError::Http { status: 503, .. })));
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
    assert!(manager.stats("unknown").is_none());
    assert!(manager.is_service_healthy("unknown"));
}

#[tokio::test]
async fn test_disabled_service_bypasses_every_layer() {
    let manager = ResilienceManager::new();
    manager
        .configure_service(
            "legacy",
            ServiceResilienceConfig::disabled().rate_limiter(RateLimiterConfig::per_second(1.0)),
        )
        .unwrap();

    for _ in 0..5 {
        let result = manager
            .execute_with_resilience("legacy", || async { Ok(1) })
            .await;
        assert!(result.is_ok());
    }
    assert_eq!(manager.rate_limiter("legacy").unwrap().stats().accepted, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_with_eventual_success() {
    let manager = ResilienceManager::builder()
        .service("messaging", service_config())
        .build()
        .unwrap();
    let attempt_count = Arc::new(AtomicU32::new(0));
    let attempt_count_clone = attempt_count.clone();

    let result = manager
        .execute_with_options(
            "messaging",
            move || {
                let count = attempt_count_clone.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(ResilienceError::network(
                            NetworkErrorKind::ConnectionReset,
                            "connection reset",
                        ))
                    } else {
                        Ok(42)
                    }
                }
            },
            no_jitter(),
        )
        .await;

    assert_eq!(result.unwrap(), 42);
    assert_eq!(attempt_count.load(Ordering::SeqCst), 3);

    let retry = manager.retry_stats("messaging");
    assert_eq!(
        retry,
        RetryStats {
            total_attempts: 3,
            successful_after_retry: 1,
            failed_after_retries: 0,
        }
    );
    // The breaker sees the retried call as a single success
    let breaker = manager.circuit_breaker("messaging").unwrap().stats();
    assert_eq!(breaker.total_successes, 1);
    assert_eq!(breaker.total_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_retries_open_the_circuit() {
    let observer = Arc::new(RecordingObserver::new());
    let manager = ResilienceManager::builder()
        .observer(observer.clone())
        .service("storage", service_config())
        .build()
        .unwrap();
    let attempt_count = Arc::new(AtomicU32::new(0));

    for _ in 0..2 {
        let count = attempt_count.clone();
        let result: Result<(), _> = manager
            .execute_with_options(
                "storage",
                move || {
                    let count = count.clone();
                    async move {
                        count.fetch_add(1, Ordering::SeqCst);
                        Err(unavailable())
                    }
                },
                no_jitter(),
            )
            .await;
        assert!(matches!(
            result,
            Err(ResilienceError::RetryExhausted { attempts: 3, .. })
        ));
    }
    assert_eq!(attempt_count.load(Ordering::SeqCst), 6);
    assert!(!manager.is_service_healthy("storage"));

    let count = attempt_count.clone();
    let result: Result<(), _> = manager
        .execute_with_resilience("storage", move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::CircuitOpen { .. })));
    assert_eq!(attempt_count.load(Ordering::SeqCst), 6);
    assert_eq!(
        observer.transitions(),
        vec![("storage".to_string(), CircuitState::Closed, CircuitState::Open)]
    );

    let stats = manager.retry_stats("storage");
    assert_eq!(stats.total_attempts, 6);
    assert_eq!(stats.failed_after_retries, 2);
}

#[tokio::test]
async fn test_rate_limit_rejection_does_not_touch_breaker() {
    let config = service_config().rate_limiter(RateLimiterConfig::new(1.0, Duration::from_secs(60)));
    let manager = ResilienceManager::builder()
        .service("transcription", config)
        .build()
        .unwrap();
    let attempt_count = Arc::new(AtomicU32::new(0));

    let first = manager
        .execute_with_resilience("transcription", || async { Ok(()) })
        .await;
    assert!(first.is_ok());

    let count = attempt_count.clone();
    let second = manager
        .execute_with_resilience("transcription", move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;

    match second {
        Err(ResilienceError::RateLimitExceeded { service, retry_after }) => {
            assert_eq!(service, "transcription");
            assert!(retry_after.is_some());
        }
        other => panic!("expected RateLimitExceeded, got {:?}", other),
    }
    assert_eq!(attempt_count.load(Ordering::SeqCst), 0);

    let breaker = manager.circuit_breaker("transcription").unwrap().stats();
    assert_eq!(breaker.total_failures, 0);
    assert_eq!(breaker.total_successes, 1);
    assert_eq!(breaker.total_rejections, 0);
}

#[tokio::test(start_paused = true)]
async fn test_skip_options() {
    let manager = ResilienceManager::builder()
        .service("transcription", service_config())
        .build()
        .unwrap();
    let attempt_count = Arc::new(AtomicU32::new(0));
    let count = attempt_count.clone();

    let result: Result<(), _> = manager
        .execute_with_options(
            "transcription",
            move || {
                let count = count.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(unavailable())
                }
            },
            ExecuteOptions::new()
                .skip_retry()
                .skip_circuit_breaker()
                .skip_rate_limit(),
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Http { status: 503, .. })));
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);

    let stats = manager.stats("transcription").unwrap();
    assert_eq!(stats.circuit_breaker.unwrap().total_failures, 0);
    assert_eq!(stats.rate_limiter.unwrap().accepted, 0);
    assert_eq!(stats.retry.total_attempts, 0);
}

#[tokio::test]
async fn test_token_cost_above_capacity_is_rejected() {
    let manager = ResilienceManager::builder()
        .service("transcription", service_config())
        .build()
        .unwrap();

    let result = manager
        .execute_with_options(
            "transcription",
            || async { Ok(()) },
            ExecuteOptions::new().tokens(1000),
        )
        .await;

    assert!(matches!(
        result,
        Err(ResilienceError::RateLimitExceeded { retry_after: None, .. })
    ));
}

#[tokio::test(start_paused = true)]
async fn test_reset_service_restores_health() {
    let manager = ResilienceManager::builder()
        .service("storage", service_config())
        .build()
        .unwrap();
    manager.circuit_breaker("storage").unwrap().force_open();
    let _ = manager
        .execute_with_resilience("storage", || async { Ok(()) })
        .await;
    assert!(!manager.is_service_healthy("storage"));

    manager.reset_service("storage");

    assert!(manager.is_service_healthy("storage"));
    let stats = manager.stats("storage").unwrap();
    assert_eq!(stats.circuit_state, Some(CircuitState::Closed));
    assert_eq!(stats.retry, RetryStats::default());
    assert_eq!(stats.rate_limiter.unwrap().accepted, 0);
}

#[tokio::test]
async fn test_exhausted_limiter_is_unhealthy() {
    let config = ServiceResilienceConfig::new()
        .rate_limiter(RateLimiterConfig::new(2.0, Duration::from_secs(60)));
    let manager = ResilienceManager::new();
    manager.configure_service("messaging", config).unwrap();

    for _ in 0..2 {
        manager
            .execute_with_resilience("messaging", || async { Ok(()) })
            .await
            .unwrap();
    }

    assert!(!manager.is_service_healthy("messaging"));
    manager.reset_all();
    assert!(manager.is_service_healthy("messaging"));
}

#[tokio::test]
async fn test_remove_service_falls_back_to_direct_calls() {
    let manager = ResilienceManager::builder()
        .service("a", service_config())
        .service("b", ServiceResilienceConfig::storage())
        .build()
        .unwrap();
    assert_eq!(manager.services(), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(manager.all_stats().len(), 2);

    assert!(manager.remove_service("a"));
    assert!(!manager.remove_service("a"));
    assert!(manager.circuit_breaker("a").is_none());
    assert_eq!(manager.services(), vec!["b".to_string()]);

    let result = manager.execute_with_resilience("a", || async { Ok(5) }).await;
    assert_eq!(result.unwrap(), 5);
}

#[tokio::test]
async fn test_invalid_service_config_is_rejected() {
    let result = ResilienceManager::builder()
        .service(
            "broken",
            ServiceResilienceConfig::new().retry(RetryConfig::new().max_attempts(0)),
        )
        .build();

    let err = result.unwrap_err();
    assert!(matches!(err, ResilienceError::Configuration { .. }));
    assert!(err.to_string().contains("broken"));
}

#[tokio::test(start_paused = true)]
async fn test_custom_retry_predicate_applies_to_every_service() {
    let manager = ResilienceManager::builder()
        .retry_predicate(Arc::new(|_: &ResilienceError, _: u32| false))
        .service("transcription", service_config())
        .build()
        .unwrap();
    let attempt_count = Arc::new(AtomicU32::new(0));
    let count = attempt_count.clone();

    let result: Result<(), _> = manager
        .execute_with_resilience("transcription", move || {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::Http { status: 503, .. })));
    assert_eq!(attempt_count.load(Ordering::SeqCst), 1);
}

#[test]
fn test_manager_from_core_config() {
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
                }
            }
        }
    }"#;
    let config = CoreConfig::from_json(json).unwrap();
    let manager = ResilienceManager::from_config(&config).unwrap();

    let breaker = manager.circuit_breaker("transcription").unwrap();
    assert_eq!(breaker.config().failure_threshold, 3);
    assert!(manager.rate_limiter("transcription").is_none());
}

#[tokio::test(start_paused = true)]
async fn test_breaker_timeout_bounds_whole_retry_loop() {
    let config = ServiceResilienceConfig::new()
        .circuit_breaker(CircuitBreakerConfig::new().timeout(Duration::from_millis(250)))
        .retry(
            RetryConfig::new()
                .max_attempts(5)
                .initial_delay(Duration::from_millis(100))
                .max_delay(Duration::from_secs(1)),
        );
    let manager = ResilienceManager::builder()
        .service("search", config)
        .build()
        .unwrap();
    let calls = &AtomicU32::new(0);

    // Attempts at 0ms and 100ms; the 200ms backoff runs past the timeout.
    let result: Result<(), _> = manager
        .execute_with_options(
            "search",
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(unavailable())
            },
            no_jitter(),
        )
        .await;

    assert!(matches!(result, Err(ResilienceError::Timeout { .. })));
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let breaker = manager.circuit_breaker("search").unwrap().stats();
    assert_eq!(breaker.total_failures, 1);
    assert_eq!(manager.retry_stats("search").total_attempts, 0);
}
