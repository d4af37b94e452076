//! Test doubles for the observer and durable store seams.

use crate::cache::{DurableStore, InMemoryStore};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::observability::CircuitStateObserver;
use crate::resilience::{CircuitBreakerStats, CircuitState};
use async_trait::async_trait;
use mockall::mock;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

/// Observer that records every transition it sees
#[derive(Default)]
pub struct RecordingObserver {
    transitions: Mutex<Vec<(String, CircuitState, CircuitState)>>,
}

impl RecordingObserver {
    /// Create an empty recorder
    pub fn new() -> Self {
        Self::default()
    }

    /// Transitions seen so far, oldest first
    pub fn transitions(&self) -> Vec<(String, CircuitState, CircuitState)> {
        self.transitions.lock().clone()
    }
}

impl CircuitStateObserver for RecordingObserver {
    fn on_circuit_state_change(
        &self,
        service: &str,
        old_state: CircuitState,
        new_state: CircuitState,
        _stats: &CircuitBreakerStats,
    ) {
        self.transitions
            .lock()
            .push((service.to_string(), old_state, new_state));
    }
}

/// Store that answers the first `failures` calls with HTTP 503, then
/// delegates to an [`InMemoryStore`]
pub struct FlakyStore {
    inner: InMemoryStore,
    remaining_failures: AtomicU32,
    served: AtomicU32,
}

impl FlakyStore {
    /// Fail the first `failures` calls
    pub fn new(failures: u32) -> Self {
        Self {
            inner: InMemoryStore::new(),
            remaining_failures: AtomicU32::new(failures),
            served: AtomicU32::new(0),
        }
    }

    /// The backing store, bypassing the failures
    pub fn inner(&self) -> &InMemoryStore {
        &self.inner
    }

    /// Failures returned so far
    pub fn failures_served(&self) -> u32 {
        self.served.load(Ordering::SeqCst)
    }

    fn maybe_fail(&self) -> ResilienceResult<()> {
        let failing = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.served.fetch_add(1, Ordering::SeqCst);
            Err(ResilienceError::http(503, "store unavailable"))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DurableStore for FlakyStore {
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        self.maybe_fail()?;
        self.inner.get(key).await
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ResilienceResult<()> {
        self.maybe_fail()?;
        self.inner.put(key, value, ttl).await
    }

    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        self.maybe_fail()?;
        self.inner.delete(key).await
    }

    async fn list(&self, prefix: &str) -> ResilienceResult<Vec<String>> {
        self.maybe_fail()?;
        self.inner.list(prefix).await
    }
}

mock! {
    pub Store {}

    #[async_trait]
    impl DurableStore for Store {
        async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>>;
        async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ResilienceResult<()>;
        async fn delete(&self, key: &str) -> ResilienceResult<()>;
        async fn list(&self, prefix: &str) -> ResilienceResult<Vec<String>>;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_flaky_store_recovers() {
        let store = FlakyStore::new(1);
        assert!(store.put("k", vec![1], None).await.is_err());
        assert!(store.put("k", vec![1], None).await.is_ok());
        assert_eq!(store.get("k").await.unwrap(), Some(vec![1]));
        assert_eq!(store.failures_served(), 1);
    }

    #[tokio::test]
    async fn test_mock_store_expectations() {
        let mut store = MockStore::new();
        store
            .expect_list()
            .times(1)
            .returning(|_| Ok(vec!["a".to_string()]));

        assert_eq!(store.list("").await.unwrap(), vec!["a".to_string()]);
    }
}
