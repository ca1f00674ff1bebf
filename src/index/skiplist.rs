// Lock-free ordered map used as the index's backing structure.
//
// Based on a Fraser-style lock-free skip list: wait-free reads, lock-free
// upserts, epoch-based reclamation of retired values and unlinked nodes.
// Nodes are never freed while any concurrent reader may still observe
// them (see `crate::concurrent::epoch`).

use crate::concurrent::epoch::{Atomic, Epoch, EpochGuard, Owned, Shared};
use crate::concurrent::Backoff;
use std::cmp::Ordering as CmpOrdering;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

const MAX_HEIGHT: usize = 32;
const P_FACTOR: u32 = 4;

/// A node in the skip list. `key` is immutable once linked; `value` is
/// swapped atomically on every upsert so readers never observe a torn
/// key/value pair. Each level's chain is null-terminated; there is no
/// explicit tail sentinel.
struct Node<K, V> {
    key: K,
    value: Atomic<V>,
    height: usize,
    next: [Atomic<Node<K, V>>; MAX_HEIGHT],
    marked: AtomicBool,
    fully_linked: AtomicBool,
}

impl<K, V> Node<K, V> {
    fn new(key: K, value: V, height: usize) -> Self {
        Self {
            key,
            value: Atomic::new(value),
            height,
            next: std::array::from_fn(|_| Atomic::null()),
            marked: AtomicBool::new(false),
            fully_linked: AtomicBool::new(false),
        }
    }
}

/// Lock-free, ordered key-value map.
///
/// `get` is wait-free. `upsert` and `remove` are lock-free and retry under
/// contention. A value swapped out by a concurrent writer, or a node
/// physically unlinked by `remove`, is not freed until every reader that
/// could have observed it has dropped its epoch guard.
pub struct LockFreeSkipList<K, V> {
    head: Box<HeadLevels<K, V>>,
    size: AtomicUsize,
    height: AtomicUsize,
    inserts: AtomicU64,
    updates: AtomicU64,
    removes: AtomicU64,
}

struct HeadLevels<K, V> {
    next: [Atomic<Node<K, V>>; MAX_HEIGHT],
}

/// Outcome of an `upsert`: whether a node already existed for the key.
pub enum UpsertOutcome<V> {
    Inserted,
    Replaced(V),
}

type PredsSuccs<'g, K, V> = (
    [FindCursor<'g, K, V>; MAX_HEIGHT],
    Option<Shared<'g, Node<K, V>>>,
);

/// Either "the head" (level chain roots at `head.next[level]`) or a real
/// predecessor node, so the insert/remove CAS loops don't need to special
/// case the first node on a level.
#[derive(Clone, Copy)]
enum FindCursor<'g, K, V> {
    Head,
    Node(Shared<'g, Node<K, V>>),
}

impl<K, V> LockFreeSkipList<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            head: Box::new(HeadLevels {
                next: std::array::from_fn(|_| Atomic::null()),
            }),
            size: AtomicUsize::new(0),
            height: AtomicUsize::new(1),
            inserts: AtomicU64::new(0),
            updates: AtomicU64::new(0),
            removes: AtomicU64::new(0),
        }
    }

    /// Wait-free lookup. Returns a clone of the current value, if any live
    /// (non-removed, fully-linked) node holds `key`.
    pub fn get(&self, key: &K) -> Option<V> {
        let guard = Epoch::pin();
        let found = self.find(key, &guard)?;
        let node = unsafe { found.as_ref() }?;
        if node.marked.load(Ordering::Acquire) || !node.fully_linked.load(Ordering::Acquire) {
            return None;
        }
        node.value.load(Ordering::Acquire, &guard).as_ref().cloned()
    }

    /// Insert or atomically replace the value for `key`.
    pub fn upsert(&self, key: K, value: V) -> UpsertOutcome<V> {
        let guard = Epoch::pin();
        let height = self.random_height();
        let mut backoff = Backoff::new();

        loop {
            let (preds, found) = self.find_with_preds(&key, &guard);

            if let Some(node_ptr) = found {
                if let Some(node) = unsafe { node_ptr.as_ref() } {
                    if node.fully_linked.load(Ordering::Acquire) {
                        let new_val = Owned::new(value).into_shared();
                        let old = node.value.swap(new_val, Ordering::AcqRel, &guard);
                        node.marked.store(false, Ordering::Release);
                        self.updates.fetch_add(1, Ordering::Relaxed);
                        let old_val = old.as_ref().cloned();
                        if !old.is_null() {
                            Epoch::defer(old.as_ptr());
                        }
                        return match old_val {
                            Some(v) => UpsertOutcome::Replaced(v),
                            None => UpsertOutcome::Inserted,
                        };
                    }
                }
            }

            let new_node = Owned::new(Node::new(key.clone(), value.clone(), height)).into_shared();
            let mut success = true;

            for level in 0..height {
                let succ = self.next_at(preds[level], level, &guard);
                unsafe {
                    new_node.as_ref().unwrap().next[level].store(succ, Ordering::Release);
                }
                if !self.cas_next(preds[level], level, succ, new_node, &guard) {
                    success = false;
                    break;
                }
            }

            if success {
                unsafe {
                    new_node.as_ref().unwrap().fully_linked.store(true, Ordering::Release);
                }
                self.size.fetch_add(1, Ordering::Relaxed);
                self.inserts.fetch_add(1, Ordering::Relaxed);
                let current = self.height.load(Ordering::Relaxed);
                if height > current {
                    let _ = self.height.compare_exchange(
                        current,
                        height,
                        Ordering::Relaxed,
                        Ordering::Relaxed,
                    );
                }
                return UpsertOutcome::Inserted;
            }

            backoff.snooze();
        }
    }

    /// Physically remove a node from the structure (used by the
    /// background sweep once a tombstone/expired entry no longer needs to
    /// be routable). Returns the removed value if the key was present.
    pub fn remove(&self, key: &K) -> Option<V> {
        let guard = Epoch::pin();
        loop {
            let (preds, found) = self.find_with_preds(key, &guard);
            let node_ptr = found?;
            let node = unsafe { node_ptr.as_ref()? };

            if node
                .marked
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                return None;
            }

            let removed = node.value.load(Ordering::Acquire, &guard).as_ref().cloned();

            for level in (0..node.height).rev() {
                let succ = node.next[level].load(Ordering::Acquire, &guard);
                let _ = self.cas_next(preds[level], level, node_ptr, succ, &guard);
            }

            Epoch::defer(node_ptr.as_ptr());
            self.size.fetch_sub(1, Ordering::Relaxed);
            self.removes.fetch_add(1, Ordering::Relaxed);
            return removed;
        }
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> SkipListStats {
        SkipListStats {
            size: self.len(),
            height: self.height.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removes: self.removes.load(Ordering::Relaxed),
        }
    }

    /// Collect every live (key, value) pair whose key falls in
    /// `[start, end)` (`end: None` means unbounded), in key order. This is
    /// a point-in-time snapshot taken eagerly; `crate::index` wraps it in
    /// a lazy iterator for callers that want to stop early.
    pub fn collect_range(&self, start: Option<&K>, end: Option<&K>) -> Vec<(K, V)> {
        let guard = Epoch::pin();
        let mut out = Vec::new();

        let mut curr = match start {
            Some(k) => {
                let (preds, found) = self.find_with_preds(k, &guard);
                found.or_else(|| self.next_at(preds[0], 0, &guard).as_option())
            }
            None => self.next_at(FindCursor::Head, 0, &guard).as_option(),
        };

        while let Some(ptr) = curr {
            let node = match unsafe { ptr.as_ref() } {
                Some(n) => n,
                None => break,
            };
            if let Some(end_key) = end {
                if node.key.cmp(end_key) != CmpOrdering::Less {
                    break;
                }
            }
            if !node.marked.load(Ordering::Acquire) && node.fully_linked.load(Ordering::Acquire) {
                if let Some(v) = node.value.load(Ordering::Acquire, &guard).as_ref() {
                    out.push((node.key.clone(), v.clone()));
                }
            }
            curr = node.next[0].load(Ordering::Acquire, &guard).as_option();
        }
        out
    }

    fn find<'g>(&self, key: &K, guard: &'g EpochGuard) -> Option<Shared<'g, Node<K, V>>> {
        let (_, found) = self.find_with_preds(key, guard);
        found
    }

    fn next_at<'g>(
        &self,
        cursor: FindCursor<'g, K, V>,
        level: usize,
        guard: &'g EpochGuard,
    ) -> Shared<'g, Node<K, V>> {
        match cursor {
            FindCursor::Head => self.head.next[level].load(Ordering::Acquire, guard),
            FindCursor::Node(ptr) => unsafe { ptr.as_ref().unwrap().next[level].load(Ordering::Acquire, guard) },
        }
    }

    fn cas_next<'g>(
        &self,
        cursor: FindCursor<'g, K, V>,
        level: usize,
        expected: Shared<'g, Node<K, V>>,
        new: Shared<'g, Node<K, V>>,
        guard: &'g EpochGuard,
    ) -> bool {
        match cursor {
            FindCursor::Head => self.head.next[level]
                .compare_exchange(expected, new, Ordering::Release, Ordering::Acquire, guard)
                .is_ok(),
            FindCursor::Node(ptr) => unsafe {
                ptr.as_ref().unwrap().next[level]
                    .compare_exchange(expected, new, Ordering::Release, Ordering::Acquire, guard)
                    .is_ok()
            },
        }
    }

    /// Classic skip-list search: walk down from the top level, keeping the
    /// last node less than `key` at each level as its predecessor.
    /// Opportunistically unlinks nodes marked for physical removal.
    fn find_with_preds<'g>(&self, key: &K, guard: &'g EpochGuard) -> PredsSuccs<'g, K, V> {
        'retry: loop {
            let mut preds = [FindCursor::Head; MAX_HEIGHT];
            let mut found = None;

            let top = self.height.load(Ordering::Relaxed);
            let mut pred_cursor = FindCursor::Head;

            for level in (0..top).rev() {
                let mut curr = self.next_at(pred_cursor, level, guard);

                loop {
                    let curr_node = match unsafe { curr.as_ref() } {
                        Some(n) => n,
                        None => break,
                    };
                    let next = curr_node.next[level].load(Ordering::Acquire, guard);

                    if curr_node.marked.load(Ordering::Acquire) {
                        if !self.cas_next(pred_cursor, level, curr, next, guard) {
                            continue 'retry;
                        }
                        curr = next;
                        continue;
                    }

                    match curr_node.key.cmp(key) {
                        CmpOrdering::Less => {
                            pred_cursor = FindCursor::Node(curr);
                            curr = next;
                        }
                        CmpOrdering::Equal => {
                            if level == 0 {
                                found = Some(curr);
                            }
                            break;
                        }
                        CmpOrdering::Greater => break,
                    }
                }

                preds[level] = pred_cursor;
            }

            return (preds, found);
        }
    }

    fn random_height(&self) -> usize {
        let mut height = 1;
        let mut rng = ThreadLocalRng::seed();
        while height < MAX_HEIGHT && rng.next() % P_FACTOR == 0 {
            height += 1;
        }
        height
    }
}

impl<'g, K, V> Shared<'g, Node<K, V>> {
    fn as_option(self) -> Option<Shared<'g, Node<K, V>>> {
        if self.is_null() {
            None
        } else {
            Some(self)
        }
    }
}

struct ThreadLocalRng {
    state: u64,
}

impl ThreadLocalRng {
    fn seed() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos() as u64;
        let addr = &nanos as *const u64 as u64;
        let seed = (nanos ^ 0x9E37_79B9_7F4A_7C15 ^ addr) | 1;
        Self { state: seed }
    }

    fn next(&mut self) -> u32 {
        self.state ^= self.state << 13;
        self.state ^= self.state >> 7;
        self.state ^= self.state << 17;
        (self.state >> 32) as u32
    }
}

#[derive(Debug, Clone)]
pub struct SkipListStats {
    pub size: usize,
    pub height: usize,
    pub inserts: u64,
    pub updates: u64,
    pub removes: u64,
}

impl<K, V> Default for LockFreeSkipList<K, V>
where
    K: Ord + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn insert_then_get() {
        let list: LockFreeSkipList<u64, &'static str> = LockFreeSkipList::new();
        assert!(matches!(list.upsert(1, "one"), UpsertOutcome::Inserted));
        assert!(matches!(list.upsert(2, "two"), UpsertOutcome::Inserted));
        assert_eq!(list.get(&1), Some("one"));
        assert_eq!(list.get(&2), Some("two"));
        assert_eq!(list.get(&3), None);
    }

    #[test]
    fn upsert_replaces_value() {
        let list: LockFreeSkipList<u64, &'static str> = LockFreeSkipList::new();
        list.upsert(1, "one");
        match list.upsert(1, "uno") {
            UpsertOutcome::Replaced(old) => assert_eq!(old, "one"),
            UpsertOutcome::Inserted => panic!("expected replace"),
        }
        assert_eq!(list.get(&1), Some("uno"));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn remove_then_get() {
        let list: LockFreeSkipList<u64, &'static str> = LockFreeSkipList::new();
        list.upsert(1, "one");
        assert_eq!(list.remove(&1), Some("one"));
        assert_eq!(list.get(&1), None);
        assert_eq!(list.remove(&1), None);
    }

    #[test]
    fn range_collect_is_ordered() {
        let list: LockFreeSkipList<u64, u64> = LockFreeSkipList::new();
        for k in [5, 1, 3, 2, 4] {
            list.upsert(k, k * 10);
        }
        let collected = list.collect_range(None, None);
        let keys: Vec<u64> = collected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn range_collect_respects_bounds() {
        let list: LockFreeSkipList<u64, u64> = LockFreeSkipList::new();
        for k in 0..10u64 {
            list.upsert(k, k);
        }
        let collected = list.collect_range(Some(&3), Some(&7));
        let keys: Vec<u64> = collected.iter().map(|(k, _)| *k).collect();
        assert_eq!(keys, vec![3, 4, 5, 6]);
    }

    #[test]
    fn concurrent_upserts() {
        let list = Arc::new(LockFreeSkipList::<u64, u64>::new());
        let mut handles = vec![];
        for i in 0..8u64 {
            let list = Arc::clone(&list);
            handles.push(thread::spawn(move || {
                for j in 0..200u64 {
                    list.upsert(i * 1000 + j, j);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(list.len(), 1600);
    }
}
