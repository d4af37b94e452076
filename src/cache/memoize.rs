use crate::cache::memory::{CacheOptions, MemoryCache};
use crate::errors::ResilienceResult;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::trace;

/// Memoizes idempotent calls keyed by a hash of their input.
///
/// Two calls with the same namespace and content share one cache entry, so
/// classifying the same text twice reaches the classifier once. Keys have the
/// form `namespace:hex(sha256(content))`.
pub struct ContentHashCache<V> {
    namespace: String,
    cache: Arc<MemoryCache<V>>,
    ttl: Option<Duration>,
}

impl<V> ContentHashCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Memoize into `cache` under `namespace`
    pub fn new(namespace: impl Into<String>, cache: Arc<MemoryCache<V>>) -> Self {
        Self {
            namespace: namespace.into(),
            cache,
            ttl: None,
        }
    }

    /// TTL for memoized results; the cache default otherwise
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Cache key for `content`
    pub fn key_for(&self, content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        format!("{}:{}", self.namespace, hex::encode(hasher.finalize()))
    }

    fn options(&self) -> CacheOptions {
        match self.ttl {
            Some(ttl) => CacheOptions::new().ttl(ttl),
            None => CacheOptions::new(),
        }
    }

    /// Previously computed result for `content`, if still cached
    pub fn get(&self, content: &[u8]) -> ResilienceResult<Option<V>> {
        self.cache.get(&self.key_for(content), &self.options())
    }

    /// Returns the memoized result for `content`, or runs `compute` and
    /// memoizes what it returns.
    pub async fn get_or_compute<F, Fut>(&self, content: &[u8], compute: F) -> ResilienceResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<V>>,
    {
        let key = self.key_for(content);
        trace!(key = %key, "Memoized lookup");
        self.cache
            .get_or_insert_with(&key, compute, &self.options())
            .await
    }

    /// Forgets the result for `content`
    pub fn invalidate(&self, content: &[u8]) -> bool {
        self.cache
            .invalidate(&self.key_for(content), &self.options().scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheConfig;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn memo() -> ContentHashCache<String> {
        ContentHashCache::new(
            "classify",
            Arc::new(MemoryCache::new(MemoryCacheConfig::default())),
        )
    }

    #[test]
    fn test_key_is_namespaced_sha256() {
        let memo = memo();
        assert_eq!(
            memo.key_for(b"abc"),
            "classify:ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_identical_content_computes_once() {
        let memo = memo();
        let calls = &AtomicU32::new(0);

        for _ in 0..3 {
            let label = memo
                .get_or_compute(b"my sink is leaking", || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("maintenance".to_string())
                })
                .await
                .unwrap();
            assert_eq!(label, "maintenance");
        }
        memo.get_or_compute(b"different text", || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok("other".to_string())
        })
        .await
        .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(memo.invalidate(b"my sink is leaking"));
        assert_eq!(memo.get(b"my sink is leaking").unwrap(), None);
    }
}
