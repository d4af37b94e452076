//! Two-tier caching: a bounded in-process cache and a storage cache that
//! adds compression and write batching in front of a durable store.

mod compression;
mod entry;
mod memoize;
mod memory;
mod storage;
mod store;

pub use compression::{compress, decompress, StoredRecord, RECORD_MAGIC};
pub use memoize::ContentHashCache;
pub use memory::{CacheOptions, CacheScope, MemoryCache, MemoryCacheConfig, MemoryCacheStats};
pub use storage::{FlushReport, StorageCache, StorageCacheConfig, StorageMetrics};
pub use store::{DurableStore, InMemoryStore};
