//! Circuit state change notifications.

use crate::resilience::{CircuitBreakerStats, CircuitState};
use std::sync::Arc;
use tracing::{info, warn};

/// Receives circuit breaker state transitions.
///
/// Invoked synchronously at the transition point, after the breaker has
/// released its internal lock, so implementations may query the breaker.
pub trait CircuitStateObserver: Send + Sync {
    /// Called once per transition.
    fn on_circuit_state_change(
        &self,
        service: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        stats: &CircuitBreakerStats,
    );
}

/// Observer that writes every transition to the `tracing` log.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl CircuitStateObserver for TracingObserver {
    fn on_circuit_state_change(
        &self,
        service: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        stats: &CircuitBreakerStats,
    ) {
        if new_state == CircuitState::Open {
            warn!(
                service,
                from = %old_state,
                consecutive_failures = stats.consecutive_failures,
                error_percentage = stats.error_percentage,
                window_requests = stats.window_requests,
                "Circuit breaker opened"
            );
        } else {
            info!(
                service,
                from = %old_state,
                to = %new_state,
                consecutive_successes = stats.consecutive_successes,
                "Circuit breaker state changed"
            );
        }
    }
}

/// Forwards each notification to several observers in registration order.
#[derive(Default, Clone)]
pub struct CompositeObserver {
    observers: Vec<Arc<dyn CircuitStateObserver>>,
}

impl CompositeObserver {
    /// Creates an empty composite.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an observer.
    pub fn with(mut self, observer: Arc<dyn CircuitStateObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Number of registered observers
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// True when no observer is registered
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl CircuitStateObserver for CompositeObserver {
    fn on_circuit_state_change(
        &self,
        service: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        stats: &CircuitBreakerStats,
    ) {
        for observer in &self.observers {
            observer.on_circuit_state_change(service, old_state, new_state, stats);
        }
    }
}
