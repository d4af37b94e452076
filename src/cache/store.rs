//! Durable key-value store abstraction.

use crate::errors::ResilienceResult;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::time::Instant;

/// Key-value store behind a [`StorageCache`](crate::cache::StorageCache).
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Bytes stored under `key`
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>>;

    /// Store `value`, expiring after `ttl` when given
    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ResilienceResult<()>;

    /// Remove `key`; removing a missing key succeeds
    async fn delete(&self, key: &str) -> ResilienceResult<()>;

    /// Keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> ResilienceResult<Vec<String>>;
}

struct StoredBytes {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredBytes {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| now < at)
    }
}

/// In-process [`DurableStore`] with TTL support, for tests and local runs.
#[derive(Default)]
pub struct InMemoryStore {
    data: Mutex<BTreeMap<String, StoredBytes>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Live keys held
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.data.lock().values().filter(|v| v.is_live(now)).count()
    }

    /// True when no live keys are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored bytes for `key` as written, without decoding
    pub fn raw(&self, key: &str) -> Option<Vec<u8>> {
        let now = Instant::now();
        self.data
            .lock()
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone())
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn get(&self, key: &str) -> ResilienceResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut data = self.data.lock();
        match data.get(key) {
            Some(stored) if stored.is_live(now) => Ok(Some(stored.value.clone())),
            Some(_) => {
                data.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> ResilienceResult<()> {
        let expires_at = ttl.and_then(|ttl| Instant::now().checked_add(ttl));
        self.data
            .lock()
            .insert(key.to_string(), StoredBytes { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> ResilienceResult<()> {
        self.data.lock().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> ResilienceResult<Vec<String>> {
        let now = Instant::now();
        Ok(self
            .data
            .lock()
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .filter(|(_, stored)| stored.is_live(now))
            .map(|(key, _)| key.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_put_get_expire() {
        let store = InMemoryStore::new();
        store
            .put("k", b"v".to_vec(), Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_list_by_prefix() {
        let store = InMemoryStore::new();
        for key in ["user:2", "user:1", "job:1", "users"] {
            store.put(key, vec![1], None).await.unwrap();
        }
        assert_eq!(
            store.list("user:").await.unwrap(),
            vec!["user:1".to_string(), "user:2".to_string()]
        );
        tokio_test::assert_ok!(store.delete("user:1").await);
        tokio_test::assert_ok!(store.delete("missing").await);
        assert_eq!(store.list("user:").await.unwrap(), vec!["user:2".to_string()]);
    }
}
