//! Bounded LRU cache of verified segment payloads

use std::collections::{BTreeMap, HashMap};

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use crate::metrics;

pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;
pub const DEFAULT_CACHE_ITEMS: usize = 10_000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bytes_served: u64,
    pub items: usize,
    pub bytes: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.hits + self.misses;
        if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        }
    }
}

struct CacheEntry {
    data: Bytes,
    tick: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<[u8; 32], CacheEntry>,
    /// Access tick -> key; the first entry is the least recently used.
    order: BTreeMap<u64, [u8; 32]>,
    tick: u64,
    bytes: usize,
    stats: CacheStats,
}

impl CacheState {
    fn touch(&mut self, key: &[u8; 32]) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.order.remove(&entry.tick);
            entry.tick = tick;
            self.order.insert(tick, *key);
        }
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.order.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.bytes -= entry.data.len();
        }
        self.stats.evictions += 1;
        metrics::record_cache_eviction();
        true
    }
}

/// Verified segment payloads keyed by their BLAKE3 content hash.
///
/// Shared by every download so a segment fetched once, by any file or any
/// earlier run, is not fetched again while it stays cached. Bounded by
/// total bytes and by entry count; the least recently used entry goes first.
pub struct SegmentCache {
    max_bytes: usize,
    max_items: usize,
    state: Mutex<CacheState>,
}

impl SegmentCache {
    pub fn new(max_bytes: usize, max_items: usize) -> Self {
        Self {
            max_bytes,
            max_items: max_items.max(1),
            state: Mutex::new(CacheState::default()),
        }
    }

    pub fn get(&self, hash: &[u8; 32]) -> Option<Bytes> {
        let mut state = self.state.lock();
        let data = state.entries.get(hash).map(|e| e.data.clone());
        match &data {
            Some(data) => {
                state.touch(hash);
                state.stats.hits += 1;
                state.stats.bytes_served += data.len() as u64;
            }
            None => state.stats.misses += 1,
        }
        metrics::record_cache_lookup(data.is_some());
        data
    }

    /// Stores `data` under `hash`, evicting as needed. The caller has
    /// already verified `data` against `hash`. Payloads larger than the
    /// whole cache are not stored.
    pub fn put(&self, hash: [u8; 32], data: Bytes) {
        if data.len() > self.max_bytes {
            return;
        }
        let mut state = self.state.lock();
        if state.entries.contains_key(&hash) {
            state.touch(&hash);
            return;
        }
        while state.bytes + data.len() > self.max_bytes || state.entries.len() >= self.max_items {
            if !state.evict_oldest() {
                break;
            }
        }

        state.tick += 1;
        let tick = state.tick;
        state.bytes += data.len();
        state.order.insert(tick, hash);
        debug!(hash = %hex::encode(&hash[..8]), bytes = data.len(), "Cached segment");
        state.entries.insert(hash, CacheEntry { data, tick });
    }

    pub fn remove(&self, hash: &[u8; 32]) -> bool {
        let mut state = self.state.lock();
        let Some(entry) = state.entries.remove(hash) else {
            return false;
        };
        state.order.remove(&entry.tick);
        state.bytes -= entry.data.len();
        true
    }

    pub fn clear(&self) {
        let mut state = self.state.lock();
        state.entries.clear();
        state.order.clear();
        state.bytes = 0;
    }

    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            items: state.entries.len(),
            bytes: state.bytes,
            ..state.stats
        }
    }
}

impl Default for SegmentCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BYTES, DEFAULT_CACHE_ITEMS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(n: u8) -> [u8; 32] {
        [n; 32]
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = SegmentCache::new(1024, 10);
        cache.put(key(1), Bytes::from_static(b"segment one"));

        assert_eq!(cache.get(&key(1)).unwrap().as_ref(), b"segment one");
        assert!(cache.get(&key(2)).is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.bytes_served, 11);
        assert_eq!(stats.bytes, 11);
        assert_eq!(stats.hit_rate(), 0.5);
    }

    #[test]
    fn test_least_recently_used_goes_first() {
        let cache = SegmentCache::new(30, 10);
        cache.put(key(1), Bytes::from(vec![1u8; 10]));
        cache.put(key(2), Bytes::from(vec![2u8; 10]));
        cache.put(key(3), Bytes::from(vec![3u8; 10]));

        // key 1 becomes the most recent, so key 2 is evicted
        assert!(cache.get(&key(1)).is_some());
        cache.put(key(4), Bytes::from(vec![4u8; 10]));

        assert!(cache.get(&key(2)).is_none());
        assert!(cache.get(&key(1)).is_some());
        assert!(cache.get(&key(3)).is_some());
        assert_eq!(cache.stats().evictions, 1);
        assert_eq!(cache.stats().bytes, 30);
    }

    #[test]
    fn test_item_limit_and_oversized_payloads() {
        let cache = SegmentCache::new(1_000, 2);
        cache.put(key(1), Bytes::from_static(b"a"));
        cache.put(key(2), Bytes::from_static(b"b"));
        cache.put(key(3), Bytes::from_static(b"c"));
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&key(1)).is_none());

        cache.put(key(9), Bytes::from(vec![0u8; 1_001]));
        assert!(cache.get(&key(9)).is_none());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_remove_and_clear() {
        let cache = SegmentCache::default();
        cache.put(key(1), Bytes::from_static(b"x"));
        cache.put(key(1), Bytes::from_static(b"x"));
        assert_eq!(cache.len(), 1);

        assert!(cache.remove(&key(1)));
        assert!(!cache.remove(&key(1)));
        assert!(cache.is_empty());

        cache.put(key(2), Bytes::from_static(b"y"));
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.stats().bytes, 0);
    }
}
