//! Circuit breaker pattern for failure isolation.

use crate::config::duration_ms;
use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::CircuitStateObserver;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Trailing window used for the volume and error-percentage checks.
pub const ROLLING_WINDOW: Duration = Duration::from_secs(60);

/// Configuration for circuit breaker behavior
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again
    pub success_threshold: u32,
    /// Hard per-call timeout
    #[serde(rename = "timeoutMs", with = "duration_ms")]
    pub timeout: Duration,
    /// Minimum requests in the rolling window before the circuit may open
    pub volume_threshold: u32,
    /// Error percentage (0-100) in the rolling window that opens the circuit
    pub error_threshold_percentage: f64,
    /// Time spent open before a trial call is admitted
    #[serde(rename = "resetTimeoutMs", with = "duration_ms")]
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            timeout: Duration::from_secs(30),
            volume_threshold: 10,
            error_threshold_percentage: 50.0,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

impl CircuitBreakerConfig {
    /// Create a new configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set failure threshold
    pub fn failure_threshold(mut self, n: u32) -> Self {
        self.failure_threshold = n;
        self
    }

    /// Set success threshold
    pub fn success_threshold(mut self, n: u32) -> Self {
        self.success_threshold = n;
        self
    }

    /// Set per-call timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set volume threshold
    pub fn volume_threshold(mut self, n: u32) -> Self {
        self.volume_threshold = n;
        self
    }

    /// Set error threshold percentage
    pub fn error_threshold_percentage(mut self, pct: f64) -> Self {
        self.error_threshold_percentage = pct;
        self
    }

    /// Set reset timeout
    pub fn reset_timeout(mut self, timeout: Duration) -> Self {
        self.reset_timeout = timeout;
        self
    }

    /// Checks the thresholds are usable.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.failure_threshold == 0 {
            return Err(ResilienceError::configuration("failureThreshold must be at least 1"));
        }
        if self.success_threshold == 0 {
            return Err(ResilienceError::configuration("successThreshold must be at least 1"));
        }
        if self.timeout.is_zero() {
            return Err(ResilienceError::configuration("timeoutMs must be positive"));
        }
        if !(0.0..=100.0).contains(&self.error_threshold_percentage) {
            return Err(ResilienceError::configuration(
                "errorThresholdPercentage must be within 0-100",
            ));
        }
        Ok(())
    }
}

/// Circuit breaker state
#[derive(Clone, Copy, PartialEq, Eq, Debug, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected without being invoked
    Open,
    /// Circuit is half-open, probing whether the dependency recovered
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of a breaker's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitBreakerStats {
    /// Current state
    pub state: CircuitState,
    /// Failures recorded since creation or reset
    pub total_failures: u64,
    /// Successes recorded since creation or reset
    pub total_successes: u64,
    /// Calls rejected while open
    pub total_rejections: u64,
    /// Failures since the last success
    pub consecutive_failures: u32,
    /// Successes since the last failure
    pub consecutive_successes: u32,
    /// Wall-clock time of the last failure
    pub last_failure_at: Option<DateTime<Utc>>,
    /// Wall-clock time of the last success
    pub last_success_at: Option<DateTime<Utc>>,
    /// Outcomes recorded in the rolling window
    pub window_requests: u32,
    /// Failures recorded in the rolling window
    pub window_failures: u32,
    /// Failure share of the rolling window, 0-100
    pub error_percentage: f64,
}

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    success: bool,
    at: Instant,
}

struct BreakerState {
    state: CircuitState,
    opened_at: Option<Instant>,
    total_failures: u64,
    total_successes: u64,
    total_rejections: u64,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    window: VecDeque<WindowEntry>,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            total_failures: 0,
            total_successes: 0,
            total_rejections: 0,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
            window: VecDeque::new(),
        }
    }

    fn prune_window(&mut self, now: Instant) {
        while let Some(front) = self.window.front() {
            if now.duration_since(front.at) > ROLLING_WINDOW {
                self.window.pop_front();
            } else {
                break;
            }
        }
    }

    fn window_failures(&self) -> u32 {
        self.window.iter().filter(|e| !e.success).count() as u32
    }

    fn error_percentage(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        self.window_failures() as f64 * 100.0 / self.window.len() as f64
    }

    fn snapshot(&self) -> CircuitBreakerStats {
        CircuitBreakerStats {
            state: self.state,
            total_failures: self.total_failures,
            total_successes: self.total_successes,
            total_rejections: self.total_rejections,
            consecutive_failures: self.consecutive_failures,
            consecutive_successes: self.consecutive_successes,
            last_failure_at: self.last_failure_at,
            last_success_at: self.last_success_at,
            window_requests: self.window.len() as u32,
            window_failures: self.window_failures(),
            error_percentage: self.error_percentage(),
        }
    }

    fn transition(&mut self, new_state: CircuitState, now: Instant) -> Transition {
        let old_state = self.state;
        self.state = new_state;
        match new_state {
            CircuitState::Open => {
                self.opened_at = Some(now);
                self.consecutive_successes = 0;
            }
            CircuitState::HalfOpen => {
                self.consecutive_successes = 0;
                self.consecutive_failures = 0;
            }
            CircuitState::Closed => {
                self.opened_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.window.clear();
            }
        }
        Transition {
            old_state,
            new_state,
            stats: self.snapshot(),
        }
    }
}

struct Transition {
    old_state: CircuitState,
    new_state: CircuitState,
    stats: CircuitBreakerStats,
}

/// Circuit breaker guarding one named dependency.
///
/// Transitions:
/// - `Closed -> Open` when the rolling window holds at least
///   `volume_threshold` outcomes and either the consecutive failures reach
///   `failure_threshold` or the error percentage reaches
///   `error_threshold_percentage`
/// - `Open -> HalfOpen` lazily, on the first call after `reset_timeout`
/// - `HalfOpen -> Closed` after `success_threshold` consecutive successes
/// - `HalfOpen -> Open` on any failure
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
    observer: Option<Arc<dyn CircuitStateObserver>>,
}

impl CircuitBreaker {
    /// Create a new circuit breaker for `service`
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            state: Mutex::new(BreakerState::new()),
            observer: None,
        }
    }

    /// Attach an observer for state transitions
    pub fn with_observer(mut self, observer: Arc<dyn CircuitStateObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Name of the guarded service
    pub fn service(&self) -> &str {
        &self.service
    }

    /// Breaker configuration
    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, without triggering the lazy half-open transition
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// True while open and the reset timeout has not yet elapsed
    pub fn is_open(&self) -> bool {
        self.time_until_half_open().map_or(false, |d| !d.is_zero())
    }

    /// Time until an open circuit admits a trial call; `None` unless open
    pub fn time_until_half_open(&self) -> Option<Duration> {
        let state = self.state.lock();
        if state.state != CircuitState::Open {
            return None;
        }
        let elapsed = state
            .opened_at
            .map(|at| at.elapsed())
            .unwrap_or(Duration::MAX);
        Some(self.config.reset_timeout.saturating_sub(elapsed))
    }

    /// Snapshot of the breaker's counters
    pub fn stats(&self) -> CircuitBreakerStats {
        let mut state = self.state.lock();
        state.prune_window(Instant::now());
        state.snapshot()
    }

    /// Execute an operation through the circuit breaker.
    ///
    /// An open circuit fails with [`ResilienceError::CircuitOpen`] without
    /// invoking `operation`. Otherwise the operation runs under the
    /// configured timeout; an elapsed timeout is recorded as a failure and
    /// reported as [`ResilienceError::Timeout`].
    pub async fn execute<F, Fut, T>(&self, operation: F) -> ResilienceResult<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        self.try_admit()?;

        match tokio::time::timeout(self.config.timeout, operation()).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(error)) => {
                self.record_failure();
                Err(error)
            }
            Err(_) => {
                self.record_failure();
                Err(ResilienceError::Timeout {
                    service: self.service.clone(),
                    timeout: self.config.timeout,
                })
            }
        }
    }

    /// Admits or rejects a call, performing the lazy open -> half-open step.
    fn try_admit(&self) -> ResilienceResult<()> {
        let now = Instant::now();
        let (transition, rejection) = {
            let mut state = self.state.lock();
            let mut transition = None;

            if state.state == CircuitState::Open {
                let elapsed = state
                    .opened_at
                    .map(|at| now.duration_since(at))
                    .unwrap_or(Duration::MAX);
                if elapsed >= self.config.reset_timeout {
                    transition = Some(state.transition(CircuitState::HalfOpen, now));
                }
            }

            let rejection = if state.state == CircuitState::Open {
                state.total_rejections += 1;
                let retry_after = state
                    .opened_at
                    .map(|at| self.config.reset_timeout.saturating_sub(now.duration_since(at)));
                Some(ResilienceError::CircuitOpen {
                    service: self.service.clone(),
                    retry_after,
                })
            } else {
                None
            };
            (transition, rejection)
        };

        if let Some(t) = transition {
            self.notify(t);
        }
        match rejection {
            Some(err) => {
                debug!(service = %self.service, "Circuit open, rejecting call");
                Err(err)
            }
            None => Ok(()),
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            state.total_successes += 1;
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            state.last_success_at = Some(Utc::now());
            state.window.push_back(WindowEntry { success: true, at: now });
            state.prune_window(now);

            if state.state == CircuitState::HalfOpen
                && state.consecutive_successes >= self.config.success_threshold
            {
                Some(state.transition(CircuitState::Closed, now))
            } else {
                None
            }
        };

        if let Some(t) = transition {
            self.notify(t);
        }
    }

    /// Record a failed call
    pub fn record_failure(&self) {
        let now = Instant::now();
        let transition = {
            let mut state = self.state.lock();
            state.total_failures += 1;
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            state.last_failure_at = Some(Utc::now());
            state.window.push_back(WindowEntry { success: false, at: now });
            state.prune_window(now);

            match state.state {
                CircuitState::Closed => {
                    let volume_reached =
                        state.window.len() as u32 >= self.config.volume_threshold;
                    let failures_reached =
                        state.consecutive_failures >= self.config.failure_threshold;
                    let percentage_reached =
                        state.error_percentage() >= self.config.error_threshold_percentage;

                    if volume_reached && (failures_reached || percentage_reached) {
                        Some(state.transition(CircuitState::Open, now))
                    } else {
                        None
                    }
                }
                CircuitState::HalfOpen => Some(state.transition(CircuitState::Open, now)),
                CircuitState::Open => None,
            }
        };

        if let Some(t) = transition {
            self.notify(t);
        }
    }

    /// Forces the circuit open, e.g. during a known outage
    pub fn force_open(&self) {
        let transition = {
            let mut state = self.state.lock();
            if state.state == CircuitState::Open {
                None
            } else {
                Some(state.transition(CircuitState::Open, Instant::now()))
            }
        };
        if let Some(t) = transition {
            self.notify(t);
        }
    }

    /// Reset the breaker to closed and clear all counters
    pub fn reset(&self) {
        let transition = {
            let mut state = self.state.lock();
            let old_state = state.state;
            *state = BreakerState::new();
            (old_state != CircuitState::Closed).then(|| Transition {
                old_state,
                new_state: CircuitState::Closed,
                stats: state.snapshot(),
            })
        };
        debug!(service = %self.service, "Circuit breaker reset to CLOSED");
        if let Some(t) = transition {
            self.notify(t);
        }
    }

    fn notify(&self, transition: Transition) {
        debug!(
            service = %self.service,
            from = %transition.old_state,
            to = %transition.new_state,
            "Circuit breaker transition"
        );
        if let Some(observer) = &self.observer {
            observer.on_circuit_state_change(
                &self.service,
                transition.old_state,
                transition.new_state,
                &transition.stats,
            );
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("service", &self.service)
            .field("state", &self.state())
            .field("config", &self.config)
            .finish()
    }
}
