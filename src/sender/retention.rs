//! Retention map: sender-side product-index → retention entry, protected
//! by a reader-writer lock so concurrent per-connection retransmission
//! servicers can look up entries without blocking each other, while
//! timer-driven removal takes the writer lock. Lookups (the hot path, one
//! per retransmission request) vastly outnumber inserts/removals (one per
//! product / one per timeout), which is why a `parking_lot::RwLock` beats
//! a single mutex here.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

/// One live product's retransmission state.
pub struct RetentionEntry {
    pub prodindex: u32,
    pub prodlen: u32,
    pub metadata: Arc<[u8]>,
    pub payload: Arc<[u8]>,
    pending: parking_lot::Mutex<HashSet<u64>>,
    pub deadline: Instant,
}

impl RetentionEntry {
    pub fn new(
        prodindex: u32,
        prodlen: u32,
        metadata: Arc<[u8]>,
        payload: Arc<[u8]>,
        pending_receivers: HashSet<u64>,
        deadline: Instant,
    ) -> RetentionEntry {
        RetentionEntry {
            prodindex,
            prodlen,
            metadata,
            payload,
            pending: parking_lot::Mutex::new(pending_receivers),
            deadline,
        }
    }

    /// Removes `stream_id` from the pending set. Returns `true` iff this
    /// call emptied the set (i.e. this was the last pending receiver).
    fn release(&self, stream_id: u64) -> bool {
        let mut pending = self.pending.lock();
        pending.remove(&stream_id);
        pending.is_empty()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

/// Sender-side retention map, keyed by `prodindex`.
#[derive(Default)]
pub struct RetentionMap {
    entries: RwLock<HashMap<u32, Arc<RetentionEntry>>>,
}

impl RetentionMap {
    pub fn new() -> RetentionMap {
        RetentionMap { entries: RwLock::new(HashMap::new()) }
    }

    /// Adds a retention entry. `prodindex` is assumed unique among live
    /// entries (the sender is the sole writer of fresh indices).
    pub fn add(&self, entry: RetentionEntry) {
        self.entries.write().insert(entry.prodindex, Arc::new(entry));
    }

    /// Looks up a live entry by `prodindex`.
    pub fn get(&self, prodindex: u32) -> Option<Arc<RetentionEntry>> {
        self.entries.read().get(&prodindex).cloned()
    }

    /// Removes `prodindex` unconditionally. Returns `true` if an entry was
    /// present (idempotent: only the first call for a given `prodindex`
    /// returns `true`).
    pub fn remove(&self, prodindex: u32) -> bool {
        self.entries.write().remove(&prodindex).is_some()
    }

    /// Releases `stream_id` from `prodindex`'s pending set. If that empties
    /// the set, the entry is atomically removed and `true` is returned —
    /// exactly once per product, even under concurrent calls from
    /// different receivers' servicer threads.
    pub fn release_receiver(&self, prodindex: u32, stream_id: u64) -> bool {
        let became_empty = match self.entries.read().get(&prodindex) {
            Some(entry) => entry.release(stream_id),
            None => return false,
        };
        if became_empty {
            // Re-check under the writer lock before removing: another
            // thread's release() on the same entry could have raced to
            // `became_empty` for its own stream_id at nearly the same time,
            // but `pending` is keyed per entry and release() only reports
            // `true` once its own `remove` leaves the set empty, so at
            // most one caller observes `became_empty == true` for a given
            // entry's last member. The second lock acquisition here
            // guards against the entry having already been removed by a
            // concurrent `remove()`.
            self.entries.write().remove(&prodindex).is_some()
        } else {
            false
        }
    }

    /// Releases `stream_id` from every live entry's pending set (used when
    /// a receiver's connection drops). Returns the `prodindex`es that
    /// became empty-and-removed as a result, so the caller can notify
    /// `on_eop` for each exactly once.
    pub fn release_from_all(&self, stream_id: u64) -> Vec<u32> {
        let snapshot: Vec<Arc<RetentionEntry>> = self.entries.read().values().cloned().collect();
        let became_empty: Vec<u32> = snapshot
            .into_iter()
            .filter(|entry| entry.release(stream_id))
            .map(|entry| entry.prodindex)
            .collect();
        if became_empty.is_empty() {
            return became_empty;
        }
        let mut writer = self.entries.write();
        became_empty.into_iter().filter(|idx| writer.remove(idx).is_some()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc as StdArc;
    use std::time::Duration;

    fn entry(prodindex: u32, pending: &[u64]) -> RetentionEntry {
        RetentionEntry::new(
            prodindex,
            100,
            StdArc::from(b"meta".as_slice()),
            StdArc::from(vec![0u8; 100].into_boxed_slice()),
            pending.iter().copied().collect(),
            Instant::now() + Duration::from_secs(60),
        )
    }

    #[test]
    fn get_missing_returns_none() {
        let map = RetentionMap::new();
        assert!(map.get(42).is_none());
    }

    #[test]
    fn release_receiver_removes_only_when_last_pending() {
        let map = RetentionMap::new();
        map.add(entry(1, &[10, 20]));
        assert!(!map.release_receiver(1, 10));
        assert!(map.get(1).is_some());
        assert!(map.release_receiver(1, 20));
        assert!(map.get(1).is_none());
    }

    #[test]
    fn release_receiver_is_true_exactly_once() {
        let map = RetentionMap::new();
        map.add(entry(7, &[1]));
        assert!(map.release_receiver(7, 1));
        // Second call for the same (prodindex, stream) after removal: no
        // entry to act on, returns false.
        assert!(!map.release_receiver(7, 1));
    }

    #[test]
    fn remove_is_idempotent() {
        let map = RetentionMap::new();
        map.add(entry(3, &[1]));
        assert!(map.remove(3));
        assert!(!map.remove(3));
    }

    #[test]
    fn release_from_all_drops_a_disconnected_stream_everywhere() {
        let map = RetentionMap::new();
        map.add(entry(1, &[1, 2]));
        map.add(entry(2, &[1]));
        map.add(entry(3, &[2]));
        let mut removed = map.release_from_all(1);
        removed.sort();
        assert_eq!(removed, vec![2]);
        assert!(map.get(1).is_some());
        assert!(map.get(2).is_none());
        assert!(map.get(3).is_some());
    }

    #[test]
    fn release_unknown_receiver_is_noop() {
        let map = RetentionMap::new();
        map.add(entry(5, &[1, 2]));
        assert!(!map.release_receiver(5, 999));
        assert_eq!(map.get(5).unwrap().pending_count(), 2);
    }
}
