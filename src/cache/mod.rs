// Bounded LRU cache layer sitting in front of the index.
//
// This is a capacity-bounded, read-through accelerator: a miss here just
// means falling back to `Index::get`, it never means the data is gone.
// Persistence and recovery are entirely the WAL/checkpoint's concern;
// losing the whole cache on restart is harmless and expected.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Fraction of the byte budget reclaimed per eviction sweep once the
/// cache is over budget, picked by smallest (last_access, access_count)
/// first.
pub const EVICTION_FRACTION: f64 = 0.125;

struct Slot {
    value: Vec<u8>,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl Slot {
    fn size(&self) -> u64 {
        self.value.len() as u64
    }
}

#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Total bytes of cached values this cache may hold before it starts
    /// evicting (spec.md §4.D: sized by byte budget, not entry count).
    pub max_bytes: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self { max_bytes: 64 * 1024 * 1024 }
    }
}

#[derive(Debug, Default, Clone)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub len: usize,
    pub bytes_used: u64,
}

/// Bounded LRU cache keyed on the same byte-string keys as the index.
pub struct Cache {
    entries: RwLock<HashMap<Vec<u8>, Slot>>,
    max_bytes: u64,
    bytes_used: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl Cache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            max_bytes: config.max_bytes,
            bytes_used: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    /// A hit only ever takes the shared read lock: recency/frequency
    /// bookkeeping goes through the slot's own atomics, not the map lock,
    /// so concurrent hits never block each other.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entries = self.entries.read();
        if let Some(slot) = entries.get(key) {
            slot.last_access.store(now_millis(), Ordering::Relaxed);
            slot.access_count.fetch_add(1, Ordering::Relaxed);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(slot.value.clone())
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    pub fn put(&self, key: Vec<u8>, value: Vec<u8>) {
        let incoming_size = value.len() as u64;
        let mut entries = self.entries.write();
        let slot = Slot {
            value,
            last_access: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        };
        if let Some(old) = entries.insert(key, slot) {
            self.bytes_used.fetch_sub(old.size(), Ordering::Relaxed);
        }
        self.bytes_used.fetch_add(incoming_size, Ordering::Relaxed);

        if self.bytes_used.load(Ordering::Relaxed) > self.max_bytes {
            Self::evict_locked(&mut entries, self.max_bytes, &self.bytes_used, &self.evictions);
        }
    }

    pub fn invalidate(&self, key: &[u8]) {
        if let Some(slot) = self.entries.write().remove(key) {
            self.bytes_used.fetch_sub(slot.size(), Ordering::Relaxed);
        }
    }

    pub fn clear(&self) {
        self.entries.write().clear();
        self.bytes_used.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            len: self.len(),
            bytes_used: self.bytes_used.load(Ordering::Relaxed),
        }
    }

    /// Reclaim at least `EVICTION_FRACTION` of the byte budget, evicting
    /// the entries with the smallest (last_access, access_count) first
    /// until that many bytes have been freed.
    fn evict_locked(
        entries: &mut HashMap<Vec<u8>, Slot>,
        max_bytes: u64,
        bytes_used: &AtomicU64,
        evictions: &AtomicU64,
    ) {
        let target_bytes = ((max_bytes as f64) * EVICTION_FRACTION).ceil() as u64;
        let target_bytes = target_bytes.max(1);

        let mut candidates: Vec<(Vec<u8>, u64, u64, u64)> = entries
            .iter()
            .map(|(k, s)| {
                (
                    k.clone(),
                    s.last_access.load(Ordering::Relaxed),
                    s.access_count.load(Ordering::Relaxed),
                    s.size(),
                )
            })
            .collect();
        candidates.sort_by_key(|(_, last_access, access_count, _)| (*last_access, *access_count));

        let mut reclaimed = 0u64;
        for (key, _, _, size) in candidates {
            if reclaimed >= target_bytes {
                break;
            }
            entries.remove(&key);
            bytes_used.fetch_sub(size, Ordering::Relaxed);
            evictions.fetch_add(1, Ordering::Relaxed);
            reclaimed += size;
        }
    }
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_then_get() {
        let cache = Cache::new(CacheConfig { max_bytes: 1024 });
        cache.put(b"a".to_vec(), b"1".to_vec());
        assert_eq!(cache.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(cache.get(b"missing"), None);
        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn eviction_reclaims_once_over_the_byte_budget() {
        let cache = Cache::new(CacheConfig { max_bytes: 80 });
        for i in 0..9u32 {
            cache.put(i.to_be_bytes().to_vec(), vec![0u8; 10]);
        }
        assert!(cache.stats().bytes_used <= 80);
        assert!(cache.len() < 9);
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn overwriting_a_key_does_not_double_count_its_bytes() {
        let cache = Cache::new(CacheConfig { max_bytes: 1024 });
        cache.put(b"a".to_vec(), vec![0u8; 100]);
        cache.put(b"a".to_vec(), vec![0u8; 10]);
        assert_eq!(cache.stats().bytes_used, 10);
    }

    #[test]
    fn invalidate_removes_entry() {
        let cache = Cache::new(CacheConfig::default());
        cache.put(b"a".to_vec(), b"1".to_vec());
        cache.invalidate(b"a");
        assert_eq!(cache.get(b"a"), None);
    }
}
