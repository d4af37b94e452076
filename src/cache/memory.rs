use crate::cache::compression::{compress, decompress};
use crate::cache::entry::{CacheEntry, StoredValue};
use crate::config::{duration_ms, env_parse};
use crate::errors::{ResilienceError, ResilienceResult};
use parking_lot::Mutex;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A sweep of expired entries runs after this many `set` calls.
const SWEEP_EVERY_SETS: u32 = 100;

/// Configuration for [`MemoryCache`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryCacheConfig {
    /// Byte budget across all scopes
    pub max_bytes: usize,
    /// TTL used when a `set` does not give one
    #[serde(rename = "defaultTtlMs", with = "duration_ms")]
    pub default_ttl: Duration,
    /// Values whose serialized form is longer than this are kept compressed.
    /// `None` disables compression.
    pub compression_threshold: Option<usize>,
    /// zstd level
    pub compression_level: i32,
    /// Period of the background sweep started by
    /// [`MemoryCache::spawn_cleanup_task`]
    #[serde(rename = "cleanupIntervalMs", with = "duration_ms")]
    pub cleanup_interval: Duration,
}

impl Default for MemoryCacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: 50 * 1024 * 1024,
            default_ttl: Duration::from_secs(300),
            compression_threshold: Some(1024),
            compression_level: 3,
            cleanup_interval: Duration::from_secs(60),
        }
    }
}

impl MemoryCacheConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the byte budget
    pub fn max_bytes(mut self, bytes: usize) -> Self {
        self.max_bytes = bytes;
        self
    }

    /// Set the default TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Set the compression threshold
    pub fn compression_threshold(mut self, threshold: Option<usize>) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set the zstd level
    pub fn compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }

    /// Set the background sweep period
    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    /// Defaults overridden by `RESILIENCE_CACHE_*` variables.
    pub fn from_env() -> ResilienceResult<Self> {
        let mut config = Self::default();
        if let Some(v) = env_parse("RESILIENCE_CACHE_MAX_BYTES")? {
            config.max_bytes = v;
        }
        if let Some(v) = env_parse("RESILIENCE_CACHE_DEFAULT_TTL_MS")? {
            config.default_ttl = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("RESILIENCE_CACHE_COMPRESSION_THRESHOLD")? {
            config.compression_threshold = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse("RESILIENCE_CACHE_COMPRESSION_LEVEL")? {
            config.compression_level = v;
        }
        if let Some(v) = env_parse("RESILIENCE_CACHE_CLEANUP_INTERVAL_MS")? {
            config.cleanup_interval = Duration::from_millis(v);
        }
        Ok(config)
    }

    /// Checks the budget, durations and compression level.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_bytes == 0 {
            return Err(ResilienceError::configuration("memory cache maxBytes must be positive"));
        }
        if self.default_ttl.is_zero() {
            return Err(ResilienceError::configuration("memory cache defaultTtlMs must be positive"));
        }
        if self.cleanup_interval.is_zero() {
            return Err(ResilienceError::configuration(
                "memory cache cleanupIntervalMs must be positive",
            ));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(ResilienceError::configuration(format!(
                "compression level {} is out of range",
                self.compression_level
            )));
        }
        Ok(())
    }
}

/// Partition of the cache an entry lives in.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum CacheScope {
    /// Shared by everything in the process
    #[default]
    Global,
    /// Lives for one inbound request
    Request(String),
    /// Keyed by user id
    User(String),
}

impl CacheScope {
    /// Request scope for `id`
    pub fn request(id: impl Into<String>) -> Self {
        CacheScope::Request(id.into())
    }

    /// User scope for `id`
    pub fn user(id: impl Into<String>) -> Self {
        CacheScope::User(id.into())
    }
}

/// Per-call cache options.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    /// Scope to read or write
    pub scope: CacheScope,
    /// Overrides the default TTL on `set`
    pub ttl: Option<Duration>,
    /// `Some(true)` always compresses, `Some(false)` never does, `None`
    /// applies the size threshold
    pub compress: Option<bool>,
}

impl CacheOptions {
    /// Global scope, default TTL
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the scope
    pub fn scope(mut self, scope: CacheScope) -> Self {
        self.scope = scope;
        self
    }

    /// Set the TTL
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Force compression on or off
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = Some(compress);
        self
    }
}

/// Counters for a [`MemoryCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCacheStats {
    /// Lookups that returned a value
    pub hits: u64,
    /// Lookups that found nothing live
    pub misses: u64,
    /// Entries removed to make room
    pub evictions: u64,
    /// Entries removed because their TTL passed
    pub expirations: u64,
    /// Live entries across all scopes
    pub entries: usize,
    /// Estimated bytes held
    pub bytes: usize,
    /// Byte budget
    pub max_bytes: usize,
    /// `hits / (hits + misses)`, 0 when nothing was looked up
    pub hit_rate: f64,
}

type ScopeMap<V> = HashMap<String, CacheEntry<V>>;

struct CacheState<V> {
    scopes: HashMap<CacheScope, ScopeMap<V>>,
    total_bytes: usize,
    hits: u64,
    misses: u64,
    evictions: u64,
    expirations: u64,
    sets_since_sweep: u32,
}

impl<V> CacheState<V> {
    fn new() -> Self {
        Self {
            scopes: HashMap::new(),
            total_bytes: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
            expirations: 0,
            sets_since_sweep: 0,
        }
    }

    fn entry_count(&self) -> usize {
        self.scopes.values().map(HashMap::len).sum()
    }

    fn remove(&mut self, scope: &CacheScope, key: &str) -> Option<CacheEntry<V>> {
        let map = self.scopes.get_mut(scope)?;
        let entry = map.remove(key)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        Some(entry)
    }

    fn drop_scope(&mut self, scope: &CacheScope) -> usize {
        match self.scopes.remove(scope) {
            Some(map) => {
                let freed: usize = map.values().map(|e| e.size).sum();
                self.total_bytes = self.total_bytes.saturating_sub(freed);
                map.len()
            }
            None => 0,
        }
    }

    /// Removes expired entries everywhere and drops empty request scopes.
    fn sweep(&mut self, now: Instant) -> usize {
        let mut removed = 0;
        let mut freed = 0;
        for map in self.scopes.values_mut() {
            map.retain(|_, entry| {
                if entry.is_expired(now) {
                    removed += 1;
                    freed += entry.size;
                    false
                } else {
                    true
                }
            });
        }
        self.scopes
            .retain(|scope, map| !(matches!(scope, CacheScope::Request(_)) && map.is_empty()));
        self.total_bytes = self.total_bytes.saturating_sub(freed);
        self.expirations += removed as u64;
        self.sets_since_sweep = 0;
        removed
    }

    /// Evicts lowest-scoring entries until `incoming` more bytes fit.
    fn make_room(&mut self, incoming: usize, max_bytes: usize, now: Instant) {
        if self.total_bytes + incoming <= max_bytes {
            return;
        }

        let mut candidates: Vec<(i128, CacheScope, String)> = self
            .scopes
            .iter()
            .flat_map(|(scope, map)| {
                map.iter()
                    .map(move |(key, entry)| (entry.eviction_score(now), scope.clone(), key.clone()))
            })
            .collect();
        candidates.sort_by(|a, b| a.0.cmp(&b.0));

        for (score, scope, key) in candidates {
            if self.total_bytes + incoming <= max_bytes {
                break;
            }
            if self.remove(&scope, &key).is_some() {
                self.evictions += 1;
                trace!(key = %key, score = score as i64, "Evicted cache entry");
            }
        }
    }
}

/// Bounded in-process cache with TTL expiry and hit-weighted eviction.
///
/// Entries are partitioned by [`CacheScope`]. Sizes are estimated from the
/// JSON encoding of the value, and values above the compression threshold are
/// held zstd-compressed. When a `set` would exceed the byte budget, entries
/// with the lowest `hits * 1000 + ms until expiry` are evicted first.
pub struct MemoryCache<V> {
    config: MemoryCacheConfig,
    state: Mutex<CacheState<V>>,
}

impl<V> MemoryCache<V>
where
    V: Clone + Serialize + DeserializeOwned,
{
    /// Create a new cache
    pub fn new(config: MemoryCacheConfig) -> Self {
        Self {
            config,
            state: Mutex::new(CacheState::new()),
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &MemoryCacheConfig {
        &self.config
    }

    /// Returns the live value for `key`. An expired entry is removed and
    /// counted as a miss.
    pub fn get(&self, key: &str, options: &CacheOptions) -> ResilienceResult<Option<V>> {
        let now = Instant::now();
        let stored = {
            let mut state = self.state.lock();
            let expired = match state.scopes.get(&options.scope).and_then(|m| m.get(key)) {
                None => {
                    state.misses += 1;
                    return Ok(None);
                }
                Some(entry) => entry.is_expired(now),
            };

            if expired {
                state.remove(&options.scope, key);
                state.expirations += 1;
                state.misses += 1;
                return Ok(None);
            }

            state.hits += 1;
            let entry = state
                .scopes
                .get_mut(&options.scope)
                .and_then(|m| m.get_mut(key));
            match entry {
                Some(entry) => {
                    entry.hits += 1;
                    entry.value.clone()
                }
                None => return Ok(None),
            }
        };

        match stored {
            StoredValue::Plain(value) => Ok(Some(value)),
            StoredValue::Compressed(bytes) => {
                let raw = decompress(&bytes)?;
                Ok(Some(serde_json::from_slice(&raw)?))
            }
        }
    }

    /// Stores `value` under `key`. A value larger than the whole budget is
    /// not cached, and any earlier value for `key` is dropped.
    pub fn set(&self, key: impl Into<String>, value: V, options: &CacheOptions) -> ResilienceResult<()> {
        let key = key.into();
        let serialized = serde_json::to_vec(&value)?;
        let should_compress = match options.compress {
            Some(forced) => forced,
            None => self
                .config
                .compression_threshold
                .map_or(false, |threshold| serialized.len() > threshold),
        };

        let (stored, size) = if should_compress {
            let bytes = compress(&serialized, self.config.compression_level)?;
            let size = bytes.len();
            (StoredValue::Compressed(bytes), size)
        } else {
            (StoredValue::Plain(value), serialized.len())
        };

        let mut state = self.state.lock();
        // The previous value is stale either way.
        state.remove(&options.scope, &key);

        if size > self.config.max_bytes {
            warn!(
                key = %key,
                size,
                max_bytes = self.config.max_bytes,
                "Value exceeds cache budget, not caching"
            );
            return Ok(());
        }

        let now = Instant::now();
        let ttl = options.ttl.unwrap_or(self.config.default_ttl);
        let entry = CacheEntry::new(stored, now.checked_add(ttl), size);

        state.sets_since_sweep += 1;
        if state.sets_since_sweep >= SWEEP_EVERY_SETS {
            state.sweep(now);
        }
        state.make_room(size, self.config.max_bytes, now);

        trace!(key = %key, size, compressed = entry.is_compressed(), "Cached value");
        state.total_bytes += size;
        state
            .scopes
            .entry(options.scope.clone())
            .or_default()
            .insert(key, entry);
        Ok(())
    }

    /// Returns the cached value, or runs `factory` and caches its result.
    /// Errors from `factory` are returned and nothing is cached.
    pub async fn get_or_insert_with<F, Fut>(
        &self,
        key: &str,
        factory: F,
        options: &CacheOptions,
    ) -> ResilienceResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ResilienceResult<V>>,
    {
        if let Some(value) = self.get(key, options)? {
            return Ok(value);
        }
        let value = factory().await?;
        self.set(key, value.clone(), options)?;
        Ok(value)
    }

    /// Removes `key` from `scope`. Returns true if it was present.
    pub fn invalidate(&self, key: &str, scope: &CacheScope) -> bool {
        self.state.lock().remove(scope, key).is_some()
    }

    /// Removes every entry, in any scope, whose key matches `pattern`.
    pub fn invalidate_pattern(&self, pattern: &Regex) -> usize {
        let mut state = self.state.lock();
        let mut removed = 0;
        let mut freed = 0;
        for map in state.scopes.values_mut() {
            map.retain(|key, entry| {
                if pattern.is_match(key) {
                    removed += 1;
                    freed += entry.size;
                    false
                } else {
                    true
                }
            });
        }
        state.total_bytes = state.total_bytes.saturating_sub(freed);
        debug!(pattern = %pattern, removed, "Invalidated cache entries by pattern");
        removed
    }

    /// Removes expired entries and empty request scopes. Returns the number
    /// of entries removed.
    pub fn cleanup(&self) -> usize {
        let removed = self.state.lock().sweep(Instant::now());
        if removed > 0 {
            debug!(removed, "Removed expired cache entries");
        }
        removed
    }

    /// Drops a request scope. Call when the request finishes.
    pub fn clear_request_scope(&self, request_id: &str) -> usize {
        self.state
            .lock()
            .drop_scope(&CacheScope::Request(request_id.to_string()))
    }

    /// Drops a user scope.
    pub fn clear_user_scope(&self, user_id: &str) -> usize {
        self.state
            .lock()
            .drop_scope(&CacheScope::User(user_id.to_string()))
    }

    /// Removes every entry. Counters are kept.
    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.scopes.clear();
        state.total_bytes = 0;
    }

    /// Entries held, expired ones included until swept
    pub fn len(&self) -> usize {
        self.state.lock().entry_count()
    }

    /// True when no entries are held
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of the counters
    pub fn stats(&self) -> MemoryCacheStats {
        let state = self.state.lock();
        let lookups = state.hits + state.misses;
        MemoryCacheStats {
            hits: state.hits,
            misses: state.misses,
            evictions: state.evictions,
            expirations: state.expirations,
            entries: state.entry_count(),
            bytes: state.total_bytes,
            max_bytes: self.config.max_bytes,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                state.hits as f64 / lookups as f64
            },
        }
    }
}

impl<V> MemoryCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Runs [`cleanup`](Self::cleanup) every `cleanup_interval` until the
    /// cache is dropped.
    pub fn spawn_cleanup_task(self: &Arc<Self>) -> JoinHandle<()> {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.config.cleanup_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.cleanup();
                    }
                    None => break,
                }
            }
        })
    }
}

impl<V> std::fmt::Debug for MemoryCache<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MemoryCache")
            .field("entries", &state.entry_count())
            .field("bytes", &state.total_bytes)
            .field("max_bytes", &self.config.max_bytes)
            .finish()
    }
}
