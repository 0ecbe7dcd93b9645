//! Byte-budgeted, TTL-bounded LRU cache for resolved batches.
//!
//! One pin page usually touches few distinct batches, but rewinds and
//! multi-topic messages revisit the same batch many times; caching the parsed
//! `(batch, manifest)` pair avoids a store read and a manifest parse per pin.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use shared_types::{BatchManifest, BatchPersisted, Bytes32};
use uuid::Uuid;

/// Cache key: a batch is re-resolved if it reappears under a different hash.
pub type BatchCacheKey = (Uuid, Bytes32);

struct CacheSlot {
    batch: BatchPersisted,
    manifest: BatchManifest,
    size: usize,
    expires: Instant,
    last_used: u64,
}

/// The cache. Readers extend the TTL on hit; inserts evict expired entries
/// first, then least-recently-used entries until the byte budget fits.
pub struct BatchCache {
    max_bytes: usize,
    ttl: Duration,
    slots: HashMap<BatchCacheKey, CacheSlot>,
    total_bytes: usize,
    tick: u64,
}

impl BatchCache {
    /// Create a cache with the given byte budget and entry TTL.
    #[must_use]
    pub fn new(max_bytes: usize, ttl: Duration) -> Self {
        BatchCache {
            max_bytes,
            ttl,
            slots: HashMap::new(),
            total_bytes: 0,
            tick: 0,
        }
    }

    /// Look up a batch, extending its TTL on hit.
    pub fn get(&mut self, key: &BatchCacheKey) -> Option<(BatchPersisted, BatchManifest)> {
        self.tick += 1;
        let now = Instant::now();
        let expired = match self.slots.get(key) {
            Some(slot) => slot.expires <= now,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        let slot = self.slots.get_mut(key).expect("checked above");
        slot.expires = now + self.ttl;
        slot.last_used = self.tick;
        Some((slot.batch.clone(), slot.manifest.clone()))
    }

    /// Insert a batch, evicting as needed to stay under the byte budget.
    pub fn put(&mut self, key: BatchCacheKey, batch: BatchPersisted, manifest: BatchManifest) {
        self.tick += 1;
        // The manifest string dominates the entry's real footprint.
        let size = batch.manifest.len() + 512;
        if size > self.max_bytes {
            return; // would never fit; serve it uncached
        }
        self.remove(&key);
        self.evict(size);
        self.total_bytes += size;
        self.slots.insert(
            key,
            CacheSlot {
                batch,
                manifest,
                size,
                expires: Instant::now() + self.ttl,
                last_used: self.tick,
            },
        );
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// True when the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn remove(&mut self, key: &BatchCacheKey) {
        if let Some(slot) = self.slots.remove(key) {
            self.total_bytes -= slot.size;
        }
    }

    fn evict(&mut self, incoming: usize) {
        let now = Instant::now();
        let expired: Vec<BatchCacheKey> = self
            .slots
            .iter()
            .filter(|(_, s)| s.expires <= now)
            .map(|(k, _)| *k)
            .collect();
        for key in expired {
            self.remove(&key);
        }
        while self.total_bytes + incoming > self.max_bytes {
            let Some(oldest) = self
                .slots
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(k, _)| *k)
            else {
                break;
            };
            self.remove(&oldest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::{
        BatchHeader, BatchPersisted, BatchType, SignerRef, TransactionRef, TransactionType,
    };

    fn batch_of_size(manifest_len: usize) -> (BatchPersisted, BatchManifest) {
        let id = Uuid::new_v4();
        let tx = TransactionRef {
            tx_type: TransactionType::BatchPin,
            id: None,
        };
        let persisted = BatchPersisted {
            header: BatchHeader {
                id,
                batch_type: BatchType::Broadcast,
                namespace: "ns1".to_string(),
                signer: SignerRef::default(),
                group: None,
                created: 0,
            },
            manifest: "m".repeat(manifest_len),
            tx: tx.clone(),
            hash: Bytes32::new([1; 32]),
        };
        let manifest = BatchManifest {
            version: 1,
            id,
            tx,
            messages: vec![],
            data: vec![],
        };
        (persisted, manifest)
    }

    #[test]
    fn test_hit_and_miss() {
        let mut cache = BatchCache::new(64 * 1024, Duration::from_secs(60));
        let (batch, manifest) = batch_of_size(100);
        let key = (batch.header.id, batch.hash);

        assert!(cache.get(&key).is_none());
        cache.put(key, batch.clone(), manifest);
        let (hit, _) = cache.get(&key).unwrap();
        assert_eq!(hit.header.id, batch.header.id);
    }

    #[test]
    fn test_byte_budget_evicts_lru() {
        // Budget fits two entries (each 1000 + 512 overhead).
        let mut cache = BatchCache::new(3100, Duration::from_secs(60));
        let entries: Vec<_> = (0..3).map(|_| batch_of_size(1000)).collect();
        let keys: Vec<BatchCacheKey> =
            entries.iter().map(|(b, _)| (b.header.id, b.hash)).collect();

        cache.put(keys[0], entries[0].0.clone(), entries[0].1.clone());
        cache.put(keys[1], entries[1].0.clone(), entries[1].1.clone());
        assert_eq!(cache.len(), 2);

        // Touch entry 0 so entry 1 becomes the eviction candidate.
        assert!(cache.get(&keys[0]).is_some());
        cache.put(keys[2], entries[2].0.clone(), entries[2].1.clone());

        assert!(cache.get(&keys[0]).is_some());
        assert!(cache.get(&keys[1]).is_none());
        assert!(cache.get(&keys[2]).is_some());
    }

    #[test]
    fn test_expired_entries_miss() {
        let mut cache = BatchCache::new(64 * 1024, Duration::ZERO);
        let (batch, manifest) = batch_of_size(100);
        let key = (batch.header.id, batch.hash);
        cache.put(key, batch, manifest);
        assert!(cache.get(&key).is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oversized_entry_not_cached() {
        let mut cache = BatchCache::new(256, Duration::from_secs(60));
        let (batch, manifest) = batch_of_size(1000);
        let key = (batch.header.id, batch.hash);
        cache.put(key, batch, manifest);
        assert!(cache.get(&key).is_none());
    }
}
