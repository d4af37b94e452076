use tokio::time::Instant;

/// Value held by the memory tier.
#[derive(Debug, Clone)]
pub(crate) enum StoredValue<V> {
    Plain(V),
    /// zstd-compressed JSON of the value
    Compressed(Vec<u8>),
}

#[derive(Debug, Clone)]
pub(crate) struct CacheEntry<V> {
    pub(crate) value: StoredValue<V>,
    /// `None` when the TTL reaches past any representable instant
    pub(crate) expires_at: Option<Instant>,
    pub(crate) hits: u64,
    /// Estimated bytes: serialized length, or compressed length
    pub(crate) size: usize,
}

impl<V> CacheEntry<V> {
    pub(crate) fn new(value: StoredValue<V>, expires_at: Option<Instant>, size: usize) -> Self {
        Self {
            value,
            expires_at,
            hits: 0,
            size,
        }
    }

    pub(crate) fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| now >= at)
    }

    pub(crate) fn is_compressed(&self) -> bool {
        matches!(self.value, StoredValue::Compressed(_))
    }

    /// Lower scores are evicted first: `hits * 1000 + ms until expiry`.
    pub(crate) fn eviction_score(&self, now: Instant) -> i128 {
        let remaining_ms = match self.expires_at {
            Some(at) if at >= now => (at - now).as_millis() as i128,
            Some(at) => -((now - at).as_millis() as i128),
            None => i128::from(u64::MAX),
        };
        i128::from(self.hits) * 1000 + remaining_ms
    }
}
