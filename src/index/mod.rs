// Lock-free ordered index over durable entries.
//
// Wraps `skiplist::LockFreeSkipList` with the entry lifecycle the storage
// engine needs: LSN-stamped values, optional TTL expiry, tombstones for
// deletes, and access bookkeeping the cache layer reads to pick eviction
// candidates. A background thread sweeps expired and tombstoned entries
// out of the structure once they're no longer needed for recovery.

pub mod skiplist;

use crate::lsn::LsnAllocator;
use parking_lot::Mutex;
use skiplist::{LockFreeSkipList, UpsertOutcome};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// A single versioned value held by the index.
///
/// `expires_at_millis` is wall-clock (Unix epoch millis), not a monotonic
/// instant, so a checkpointed entry's TTL survives a restart intact.
/// `last_access` / `access_count` are updated on every `get` and are the
/// signal the cache layer's LRU eviction reads; they are not persisted.
pub struct Entry {
    pub value: Vec<u8>,
    pub lsn: u64,
    pub expires_at_millis: Option<u64>,
    tombstone: AtomicU8,
    last_access: AtomicU64,
    access_count: AtomicU64,
}

impl Entry {
    fn live(value: Vec<u8>, lsn: u64, ttl: Option<Duration>) -> Self {
        Self {
            value,
            lsn,
            expires_at_millis: ttl.map(|d| now_millis() + d.as_millis() as u64),
            tombstone: AtomicU8::new(0),
            last_access: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        }
    }

    /// Reconstructs a live entry exactly as it existed when checkpointed
    /// or logged, preserving its absolute expiry rather than resetting a
    /// fresh TTL window from the restart time.
    pub fn from_persisted(value: Vec<u8>, lsn: u64, expires_at_millis: Option<u64>) -> Self {
        Self {
            value,
            lsn,
            expires_at_millis,
            tombstone: AtomicU8::new(0),
            last_access: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        }
    }

    fn tombstone(lsn: u64) -> Self {
        Self {
            value: Vec::new(),
            lsn,
            expires_at_millis: None,
            tombstone: AtomicU8::new(1),
            last_access: AtomicU64::new(now_millis()),
            access_count: AtomicU64::new(0),
        }
    }

    pub fn is_tombstone(&self) -> bool {
        self.tombstone.load(Ordering::Acquire) == 1
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at_millis, Some(t) if t <= now_millis())
    }

    fn touch(&self) {
        self.last_access.store(now_millis(), Ordering::Relaxed);
        self.access_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_access_millis(&self) -> u64 {
        self.last_access.load(Ordering::Relaxed)
    }

    pub fn access_count(&self) -> u64 {
        self.access_count.load(Ordering::Relaxed)
    }
}

pub fn now_millis() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// A half-open byte-string range, used by `scan`. `None` bounds are
/// unbounded on that side.
#[derive(Debug, Clone, Default)]
pub struct KeyRange {
    pub start: Option<Vec<u8>>,
    pub end: Option<Vec<u8>>,
}

impl KeyRange {
    pub fn prefix(prefix: &[u8]) -> Self {
        let start = prefix.to_vec();
        let end = prefix_upper_bound(prefix);
        Self {
            start: Some(start),
            end,
        }
    }

    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
        }
    }
}

/// Smallest byte string strictly greater than every string with `prefix`
/// as a prefix, or `None` if no such finite bound exists (prefix is all
/// 0xff bytes).
fn prefix_upper_bound(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut bound = prefix.to_vec();
    while let Some(&last) = bound.last() {
        if last == 0xff {
            bound.pop();
        } else {
            *bound.last_mut().unwrap() += 1;
            return Some(bound);
        }
    }
    None
}

/// Lock-free ordered index: `get`/`put`/`delete`/`scan` plus a
/// checkpoint-facing `snapshot_at_lsn`.
pub struct Index {
    map: LockFreeSkipList<Vec<u8>, Arc<Entry>>,
    lsn: Arc<LsnAllocator>,
    sweep_lock: Mutex<()>,
}

impl Index {
    pub fn new(lsn: Arc<LsnAllocator>) -> Self {
        Self {
            map: LockFreeSkipList::new(),
            lsn,
            sweep_lock: Mutex::new(()),
        }
    }

    /// Wait-free read. Returns `None` for missing, tombstoned, or expired
    /// keys without mutating the structure (expiry/tombstone reclamation
    /// is the sweep's job, not the reader's).
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        let entry = self.map.get(&key.to_vec())?;
        if entry.is_tombstone() || entry.is_expired() {
            return None;
        }
        entry.touch();
        Some(entry.value.clone())
    }

    /// Upsert `key`, returning the LSN minted for this write.
    pub fn put(&self, key: Vec<u8>, value: Vec<u8>, ttl: Option<Duration>) -> u64 {
        let lsn = self.lsn.next();
        let entry = Arc::new(Entry::live(value, lsn, ttl));
        self.map.upsert(key, entry);
        lsn
    }

    /// Logically delete `key` by installing a tombstone, returning the LSN
    /// minted for the delete. A no-op on an already-absent key still mints
    /// and records a tombstone, since a concurrent reader may currently
    /// believe the key exists from an in-flight recovery replay.
    pub fn delete(&self, key: Vec<u8>) -> u64 {
        let lsn = self.lsn.next();
        self.map.upsert(key, Arc::new(Entry::tombstone(lsn)));
        lsn
    }

    /// Apply a write at an already-minted LSN, used when replaying the
    /// WAL or a checkpoint during recovery. Never mints a new LSN.
    pub fn apply_put_at_lsn(&self, key: Vec<u8>, value: Vec<u8>, lsn: u64, expires_at_millis: Option<u64>) {
        self.map
            .upsert(key, Arc::new(Entry::from_persisted(value, lsn, expires_at_millis)));
    }

    /// Apply a tombstone at an already-minted LSN, used during recovery
    /// replay. Never mints a new LSN.
    pub fn apply_delete_at_lsn(&self, key: Vec<u8>, lsn: u64) {
        self.map.upsert(key, Arc::new(Entry::tombstone(lsn)));
    }

    /// Lazily scan live entries in `range`, in key order.
    pub fn scan(&self, range: KeyRange) -> ScanIter {
        let pairs = self.map.collect_range(range.start.as_ref(), range.end.as_ref());
        ScanIter {
            pairs: pairs.into_iter(),
        }
    }

    /// Point-in-time view of every non-tombstoned entry whose LSN is
    /// `<= lsn`, used by the checkpoint manager. Entries written after
    /// `lsn` are invisible; entries tombstoned at or before `lsn` are
    /// omitted (already gone as of the requested point).
    pub fn snapshot_at_lsn(&self, lsn: u64) -> Vec<(Vec<u8>, Arc<Entry>)> {
        self.map
            .collect_range(None, None)
            .into_iter()
            .filter(|(_, entry)| entry.lsn <= lsn && !entry.is_tombstone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Physically remove tombstoned entries older than `min_tombstone_age`
    /// and expired entries, reclaiming their nodes. Intended to run
    /// periodically off the RPO controller's background loop, and always
    /// after a checkpoint has captured anything still needed.
    pub fn sweep(&self, min_tombstone_age: Duration) -> SweepStats {
        let _guard = self.sweep_lock.lock();
        let now = now_millis();
        let threshold_millis = min_tombstone_age.as_millis() as u64;

        let mut reclaimed = 0u64;
        let mut scanned = 0u64;
        for (key, entry) in self.map.collect_range(None, None) {
            scanned += 1;
            let tombstone_expired =
                entry.is_tombstone() && now.saturating_sub(entry.last_access_millis()) >= threshold_millis;
            if tombstone_expired || entry.is_expired() {
                if self.map.remove(&key).is_some() {
                    reclaimed += 1;
                }
            }
        }

        SweepStats { scanned, reclaimed }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SweepStats {
    pub scanned: u64,
    pub reclaimed: u64,
}

/// Lazy iterator over a `scan` result. The underlying snapshot is taken
/// eagerly by the skip list (readers never block writers either way), but
/// callers that stop early avoid materializing values they don't touch.
pub struct ScanIter {
    pairs: std::vec::IntoIter<(Vec<u8>, Arc<Entry>)>,
}

impl Iterator for ScanIter {
    type Item = (Vec<u8>, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        for (key, entry) in self.pairs.by_ref() {
            if entry.is_tombstone() || entry.is_expired() {
                continue;
            }
            entry.touch();
            return Some((key, entry.value.clone()));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index() -> Index {
        Index::new(Arc::new(LsnAllocator::new(0)))
    }

    #[test]
    fn put_then_get() {
        let idx = index();
        idx.put(b"a".to_vec(), b"1".to_vec(), None);
        assert_eq!(idx.get(b"a"), Some(b"1".to_vec()));
        assert_eq!(idx.get(b"missing"), None);
    }

    #[test]
    fn delete_hides_value_without_removing_node() {
        let idx = index();
        idx.put(b"a".to_vec(), b"1".to_vec(), None);
        idx.delete(b"a".to_vec());
        assert_eq!(idx.get(b"a"), None);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn sweep_reclaims_old_tombstones() {
        let idx = index();
        idx.put(b"a".to_vec(), b"1".to_vec(), None);
        idx.delete(b"a".to_vec());
        let stats = idx.sweep(Duration::from_secs(0));
        assert_eq!(stats.reclaimed, 1);
        assert_eq!(idx.len(), 0);
    }

    #[test]
    fn ttl_expiry_hides_value() {
        let idx = index();
        idx.put(b"a".to_vec(), b"1".to_vec(), Some(Duration::from_millis(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(idx.get(b"a"), None);
    }

    #[test]
    fn scan_respects_prefix() {
        let idx = index();
        idx.put(b"user:1".to_vec(), b"a".to_vec(), None);
        idx.put(b"user:2".to_vec(), b"b".to_vec(), None);
        idx.put(b"order:1".to_vec(), b"c".to_vec(), None);

        let results: Vec<_> = idx.scan(KeyRange::prefix(b"user:")).collect();
        assert_eq!(results.len(), 2);
    }

    #[test]
    fn snapshot_at_lsn_excludes_writes_past_the_watermark() {
        let idx = index();
        let lsn1 = idx.put(b"a".to_vec(), b"1".to_vec(), None);
        idx.put(b"b".to_vec(), b"2".to_vec(), None);
        let snapshot = idx.snapshot_at_lsn(lsn1);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].0, b"a".to_vec());
    }
}
