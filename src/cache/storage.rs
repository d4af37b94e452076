use crate::cache::compression::StoredRecord;
use crate::cache::memory::{CacheOptions, MemoryCache, MemoryCacheConfig};
use crate::cache::store::DurableStore;
use crate::config::{duration_ms, env_parse, option_duration_ms};
use crate::errors::{ResilienceError, ResilienceResult};
use crate::resilience::ResilienceManager;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

/// Configuration for [`StorageCache`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageCacheConfig {
    /// Serialized values longer than this are written compressed. `None`
    /// disables compression.
    pub compression_threshold: Option<usize>,
    /// zstd level
    pub compression_level: i32,
    /// Queued operations that trigger an immediate flush
    pub max_batch_size: usize,
    /// Delay before queued operations are flushed
    #[serde(rename = "flushDelayMs", with = "duration_ms")]
    pub flush_delay: Duration,
    /// Samples kept for the rolling latency averages
    pub latency_samples: usize,
    /// TTL passed to the store when a write gives none
    #[serde(rename = "defaultTtlMs", with = "option_duration_ms")]
    pub default_ttl: Option<Duration>,
    /// Memory tier in front of the store
    pub memory: MemoryCacheConfig,
}

impl Default for StorageCacheConfig {
    fn default() -> Self {
        Self {
            compression_threshold: Some(1024),
            compression_level: 3,
            max_batch_size: 25,
            flush_delay: Duration::from_millis(100),
            latency_samples: 100,
            default_ttl: None,
            memory: MemoryCacheConfig::default(),
        }
    }
}

impl StorageCacheConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the compression threshold
    pub fn compression_threshold(mut self, threshold: Option<usize>) -> Self {
        self.compression_threshold = threshold;
        self
    }

    /// Set the batch size
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size;
        self
    }

    /// Set the flush delay
    pub fn flush_delay(mut self, delay: Duration) -> Self {
        self.flush_delay = delay;
        self
    }

    /// Set the default store TTL
    pub fn default_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = Some(ttl);
        self
    }

    /// Set the memory tier configuration
    pub fn memory(mut self, memory: MemoryCacheConfig) -> Self {
        self.memory = memory;
        self
    }

    /// Defaults overridden by `RESILIENCE_STORAGE_*` variables; the memory
    /// tier reads `RESILIENCE_CACHE_*`.
    pub fn from_env() -> ResilienceResult<Self> {
        let mut config = Self {
            memory: MemoryCacheConfig::from_env()?,
            ..Self::default()
        };
        if let Some(v) = env_parse::<usize>("RESILIENCE_STORAGE_COMPRESSION_THRESHOLD")? {
            config.compression_threshold = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse("RESILIENCE_STORAGE_COMPRESSION_LEVEL")? {
            config.compression_level = v;
        }
        if let Some(v) = env_parse("RESILIENCE_STORAGE_MAX_BATCH_SIZE")? {
            config.max_batch_size = v;
        }
        if let Some(v) = env_parse("RESILIENCE_STORAGE_FLUSH_DELAY_MS")? {
            config.flush_delay = Duration::from_millis(v);
        }
        if let Some(v) = env_parse("RESILIENCE_STORAGE_LATENCY_SAMPLES")? {
            config.latency_samples = v;
        }
        if let Some(v) = env_parse("RESILIENCE_STORAGE_DEFAULT_TTL_MS")? {
            config.default_ttl = Some(Duration::from_millis(v));
        }
        Ok(config)
    }

    /// Checks batching, sampling and compression settings.
    pub fn validate(&self) -> ResilienceResult<()> {
        if self.max_batch_size == 0 {
            return Err(ResilienceError::configuration("maxBatchSize must be at least 1"));
        }
        if self.latency_samples == 0 {
            return Err(ResilienceError::configuration("latencySamples must be at least 1"));
        }
        if !zstd::compression_level_range().contains(&self.compression_level) {
            return Err(ResilienceError::configuration(format!(
                "compression level {} is out of range",
                self.compression_level
            )));
        }
        self.memory.validate()
    }
}

/// Counters for a [`StorageCache`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageMetrics {
    /// Reads that reached the store
    pub reads: u64,
    /// Writes sent to the store
    pub writes: u64,
    /// Deletes sent to the store
    pub deletes: u64,
    /// Lookups answered from memory or the pending queue
    pub hits: u64,
    /// Lookups that went to the store
    pub misses: u64,
    /// Bytes not written thanks to compression
    pub bytes_saved: u64,
    /// Mean of the recent store read latencies
    pub avg_read_latency_ms: f64,
    /// Mean of the recent store write latencies
    pub avg_write_latency_ms: f64,
    /// Operations waiting for a flush
    pub pending_operations: usize,
    /// Flushes that ran at least one operation
    pub batches_flushed: u64,
}

/// Result of one flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Puts written
    pub puts: usize,
    /// Deletes applied
    pub deletes: usize,
    /// Operations the store rejected; they are dropped
    pub failed: usize,
}

impl FlushReport {
    fn merge(&mut self, other: FlushReport) {
        self.puts += other.puts;
        self.deletes += other.deletes;
        self.failed += other.failed;
    }
}

enum PendingOp<V> {
    Put {
        value: V,
        bytes: Vec<u8>,
        ttl: Option<Duration>,
    },
    Delete,
}

struct PendingQueue<V> {
    ops: HashMap<String, PendingOp<V>>,
    order: VecDeque<String>,
    flush_scheduled: bool,
}

impl<V> PendingQueue<V> {
    fn new() -> Self {
        Self {
            ops: HashMap::new(),
            order: VecDeque::new(),
            flush_scheduled: false,
        }
    }

    /// Replaces any queued operation for the same key.
    fn push(&mut self, key: String, op: PendingOp<V>) {
        if self.ops.insert(key.clone(), op).is_none() {
            self.order.push_back(key);
        }
    }

    fn remove(&mut self, key: &str) -> Option<PendingOp<V>> {
        let op = self.ops.remove(key)?;
        self.order.retain(|k| k != key);
        Some(op)
    }

    /// Puts back an operation taken by a direct write that failed, unless a
    /// newer one was queued meanwhile.
    fn restore(&mut self, key: &str, op: PendingOp<V>) {
        if !self.ops.contains_key(key) {
            self.ops.insert(key.to_string(), op);
            self.order.push_front(key.to_string());
        }
    }

    fn take(&mut self, max: usize) -> Vec<(String, PendingOp<V>)> {
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(key) = self.order.pop_front() else {
                break;
            };
            if let Some(op) = self.ops.remove(&key) {
                batch.push((key, op));
            }
        }
        batch
    }
}

#[derive(Default)]
struct MetricsState {
    reads: u64,
    writes: u64,
    deletes: u64,
    hits: u64,
    misses: u64,
    bytes_saved: u64,
    read_latencies: VecDeque<Duration>,
    write_latencies: VecDeque<Duration>,
    batches_flushed: u64,
}

fn push_sample(samples: &mut VecDeque<Duration>, sample: Duration, limit: usize) {
    samples.push_back(sample);
    while samples.len() > limit {
        samples.pop_front();
    }
}

fn average_ms(samples: &VecDeque<Duration>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let total: f64 = samples.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
    total / samples.len() as f64
}

struct ResilienceBinding {
    manager: Arc<ResilienceManager>,
    service: String,
}

struct Inner<V> {
    config: StorageCacheConfig,
    store: Arc<dyn DurableStore>,
    memory: MemoryCache<V>,
    pending: Mutex<PendingQueue<V>>,
    metrics: Mutex<MetricsState>,
    resilience: Option<ResilienceBinding>,
}

/// Read-through, write-through cache in front of a [`DurableStore`].
///
/// Values are JSON-serialized and written inside a [`StoredRecord`], zstd
/// compressed when they exceed the threshold. The memory tier always holds
/// the uncompressed value. Writes can also be queued: queued operations on
/// the same key coalesce and are flushed in parallel once `max_batch_size`
/// is reached or `flush_delay` has passed.
pub struct StorageCache<V> {
    inner: Arc<Inner<V>>,
}

impl<V> Clone for StorageCache<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V> StorageCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send + Sync + 'static,
{
    /// Cache in front of `store`
    pub fn new(store: Arc<dyn DurableStore>, config: StorageCacheConfig) -> Self {
        Self::build(store, config, None)
    }

    /// Cache whose store calls run through `manager` as `service`
    pub fn with_resilience(
        store: Arc<dyn DurableStore>,
        config: StorageCacheConfig,
        manager: Arc<ResilienceManager>,
        service: impl Into<String>,
    ) -> Self {
        let binding = ResilienceBinding {
            manager,
            service: service.into(),
        };
        Self::build(store, config, Some(binding))
    }

    fn build(
        store: Arc<dyn DurableStore>,
        config: StorageCacheConfig,
        resilience: Option<ResilienceBinding>,
    ) -> Self {
        let memory = MemoryCache::new(config.memory.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                store,
                memory,
                pending: Mutex::new(PendingQueue::new()),
                metrics: Mutex::new(MetricsState::default()),
                resilience,
            }),
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &StorageCacheConfig {
        &self.inner.config
    }

    /// Value for `key`: memory tier, then queued writes, then the store.
    pub async fn get(&self, key: &str) -> ResilienceResult<Option<V>> {
        if let Some(value) = self.inner.memory.get(key, &CacheOptions::new())? {
            self.inner.metrics.lock().hits += 1;
            return Ok(Some(value));
        }

        let queued = match self.inner.pending.lock().ops.get(key) {
            Some(PendingOp::Put { value, .. }) => Some(Some(value.clone())),
            Some(PendingOp::Delete) => Some(None),
            None => None,
        };
        if let Some(queued) = queued {
            self.inner.metrics.lock().hits += 1;
            return Ok(queued);
        }

        let started = Instant::now();
        let bytes = self.call_store(|| self.inner.store.get(key)).await?;
        self.record_read(started.elapsed());

        let Some(bytes) = bytes else {
            return Ok(None);
        };
        let raw = StoredRecord::decode(&bytes)?.unpack()?;
        let value: V = serde_json::from_slice(&raw)?;
        self.remember(key, value.clone(), None)?;
        Ok(Some(value))
    }

    /// Writes `value` to the store now and updates the memory tier. A queued
    /// operation for the same key is superseded; if the write fails it stays
    /// queued.
    pub async fn put(&self, key: &str, value: V, ttl: Option<Duration>) -> ResilienceResult<()> {
        let bytes = self.encode(&value)?;
        let ttl = ttl.or(self.inner.config.default_ttl);

        let superseded = self.inner.pending.lock().remove(key);
        let started = Instant::now();
        let written = self
            .call_store(|| self.inner.store.put(key, bytes.clone(), ttl))
            .await;
        if let Err(e) = written {
            self.requeue(key, superseded);
            return Err(e);
        }
        self.record_write(started.elapsed());

        self.remember(key, value, ttl)
    }

    /// Removes `key` from both tiers. If the store delete fails, a queued
    /// operation for `key` stays queued.
    pub async fn delete(&self, key: &str) -> ResilienceResult<()> {
        let superseded = self.inner.pending.lock().remove(key);
        self.inner.memory.invalidate(key, &Default::default());

        if let Err(e) = self.call_store(|| self.inner.store.delete(key)).await {
            self.requeue(key, superseded);
            return Err(e);
        }
        self.inner.metrics.lock().deletes += 1;
        Ok(())
    }

    fn requeue(&self, key: &str, superseded: Option<PendingOp<V>>) {
        if let Some(op) = superseded {
            debug!(key = %key, "Direct write failed, keeping queued operation");
            self.inner.pending.lock().restore(key, op);
            self.schedule_flush();
        }
    }

    /// Keys starting with `prefix`, including queued puts and excluding
    /// queued deletes.
    pub async fn list(&self, prefix: &str) -> ResilienceResult<Vec<String>> {
        let mut keys = self.call_store(|| self.inner.store.list(prefix)).await?;
        {
            let pending = self.inner.pending.lock();
            keys.retain(|key| !matches!(pending.ops.get(key), Some(PendingOp::Delete)));
            keys.extend(
                pending
                    .ops
                    .iter()
                    .filter(|(key, op)| {
                        key.starts_with(prefix) && matches!(op, PendingOp::Put { .. })
                    })
                    .map(|(key, _)| key.clone()),
            );
        }
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    /// Queues a write. The memory tier is updated immediately.
    pub async fn queue_put(&self, key: &str, value: V, ttl: Option<Duration>) -> ResilienceResult<()> {
        let bytes = self.encode(&value)?;
        let ttl = ttl.or(self.inner.config.default_ttl);
        self.remember(key, value.clone(), ttl)?;
        self.enqueue(key, PendingOp::Put { value, bytes, ttl }).await;
        Ok(())
    }

    /// Queues a delete. The memory tier forgets the key immediately.
    pub async fn queue_delete(&self, key: &str) {
        self.inner.memory.invalidate(key, &Default::default());
        self.enqueue(key, PendingOp::Delete).await;
    }

    async fn enqueue(&self, key: &str, op: PendingOp<V>) {
        let full = {
            let mut pending = self.inner.pending.lock();
            pending.push(key.to_string(), op);
            pending.ops.len() >= self.inner.config.max_batch_size
        };
        if full {
            self.flush().await;
        } else {
            self.schedule_flush();
        }
    }

    fn schedule_flush(&self) {
        {
            let mut pending = self.inner.pending.lock();
            if pending.flush_scheduled || pending.ops.is_empty() {
                return;
            }
            pending.flush_scheduled = true;
        }
        let cache = self.clone();
        let deadline = Instant::now() + self.inner.config.flush_delay;
        tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            cache.flush().await;
        });
    }

    /// Writes up to `max_batch_size` queued operations in parallel. Anything
    /// left over is flushed after another `flush_delay`.
    pub async fn flush(&self) -> FlushReport {
        let batch = {
            let mut pending = self.inner.pending.lock();
            pending.flush_scheduled = false;
            pending.take(self.inner.config.max_batch_size)
        };
        if batch.is_empty() {
            return FlushReport::default();
        }

        let results = join_all(batch.iter().map(|(key, op)| self.apply(key, op))).await;

        let mut report = FlushReport::default();
        for ((key, op), result) in batch.iter().zip(results) {
            match (op, result) {
                (_, Err(e)) => {
                    error!(key = %key, error = %e, "Batched storage operation failed");
                    report.failed += 1;
                }
                (PendingOp::Put { .. }, Ok(())) => report.puts += 1,
                (PendingOp::Delete, Ok(())) => report.deletes += 1,
            }
        }
        self.inner.metrics.lock().batches_flushed += 1;
        debug!(
            puts = report.puts,
            deletes = report.deletes,
            failed = report.failed,
            "Flushed storage batch"
        );

        self.schedule_flush();
        report
    }

    /// Flushes until nothing is queued.
    pub async fn flush_all(&self) -> FlushReport {
        let mut total = FlushReport::default();
        while self.pending_operations() > 0 {
            total.merge(self.flush().await);
        }
        total
    }

    async fn apply(&self, key: &str, op: &PendingOp<V>) -> ResilienceResult<()> {
        let started = Instant::now();
        match op {
            PendingOp::Put { bytes, ttl, .. } => {
                self.call_store(|| self.inner.store.put(key, bytes.clone(), *ttl))
                    .await?;
                self.record_write(started.elapsed());
            }
            PendingOp::Delete => {
                self.call_store(|| self.inner.store.delete(key)).await?;
                self.inner.metrics.lock().deletes += 1;
            }
        }
        Ok(())
    }

    /// Operations waiting for a flush
    pub fn pending_operations(&self) -> usize {
        self.inner.pending.lock().ops.len()
    }

    /// Drops the memory tier; the store is untouched.
    pub fn clear_memory(&self) {
        self.inner.memory.clear();
    }

    /// Snapshot of the counters
    pub fn metrics(&self) -> StorageMetrics {
        let pending_operations = self.pending_operations();
        let m = self.inner.metrics.lock();
        StorageMetrics {
            reads: m.reads,
            writes: m.writes,
            deletes: m.deletes,
            hits: m.hits,
            misses: m.misses,
            bytes_saved: m.bytes_saved,
            avg_read_latency_ms: average_ms(&m.read_latencies),
            avg_write_latency_ms: average_ms(&m.write_latencies),
            pending_operations,
            batches_flushed: m.batches_flushed,
        }
    }

    fn encode(&self, value: &V) -> ResilienceResult<Vec<u8>> {
        let raw = serde_json::to_vec(value)?;
        let raw_len = raw.len();
        let record = StoredRecord::pack(
            raw,
            self.inner.config.compression_threshold,
            self.inner.config.compression_level,
        )?;
        if record.compressed {
            let saved = raw_len.saturating_sub(record.payload.len());
            self.inner.metrics.lock().bytes_saved += saved as u64;
        }
        Ok(record.encode())
    }

    fn remember(&self, key: &str, value: V, ttl: Option<Duration>) -> ResilienceResult<()> {
        let mut options = CacheOptions::new().compress(false);
        options.ttl = ttl;
        self.inner.memory.set(key, value, &options)
    }

    fn record_read(&self, latency: Duration) {
        let limit = self.inner.config.latency_samples;
        let mut m = self.inner.metrics.lock();
        m.reads += 1;
        m.misses += 1;
        push_sample(&mut m.read_latencies, latency, limit);
    }

    fn record_write(&self, latency: Duration) {
        let limit = self.inner.config.latency_samples;
        let mut m = self.inner.metrics.lock();
        m.writes += 1;
        push_sample(&mut m.write_latencies, latency, limit);
    }

    async fn call_store<T, F, Fut>(&self, operation: F) -> ResilienceResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = ResilienceResult<T>>,
    {
        match &self.inner.resilience {
            Some(binding) => {
                binding
                    .manager
                    .execute_with_resilience(&binding.service, operation)
                    .await
            }
            None => operation().await,
        }
    }
}

impl<V> Drop for Inner<V> {
    fn drop(&mut self) {
        let pending = self.pending.get_mut().ops.len();
        if pending > 0 {
            warn!(pending, "Storage cache dropped with unflushed operations");
        }
    }
}
