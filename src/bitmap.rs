//! Per-product block-presence bitmap: thread-safe, monotonic,
//! idempotent `set`, backed by a `Vec<bool>` behind a `parking_lot::Mutex`.

use parking_lot::Mutex;

struct Inner {
    bits: Vec<bool>,
    count: u32,
}

/// A bounded, thread-safe bit-set tracking which blocks of a product have
/// been received. `count` never decreases; `complete()` holds forever once
/// true.
pub struct ProdBitMap {
    inner: Mutex<Inner>,
    size: u32,
}

impl ProdBitMap {
    /// Creates a bitmap with `n` bits, all clear.
    pub fn new(n: u32) -> ProdBitMap {
        ProdBitMap {
            inner: Mutex::new(Inner { bits: vec![false; n as usize], count: 0 }),
            size: n,
        }
    }

    /// Marks bit `i` as received. No-op if already set.
    ///
    /// # Panics
    /// Panics if `i >= size()` — callers only ever derive `i` from
    /// `block_index(seqnum)` against a `seqnum` already checked to lie
    /// within the product.
    pub fn set(&self, i: u32) {
        let mut inner = self.inner.lock();
        let idx = i as usize;
        if !inner.bits[idx] {
            inner.bits[idx] = true;
            inner.count += 1;
        }
    }

    /// Current number of set bits.
    pub fn count(&self) -> u32 {
        self.inner.lock().count
    }

    /// `true` iff every bit is set (always true for a zero-sized bitmap).
    pub fn complete(&self) -> bool {
        self.count() == self.size
    }

    /// Total number of bits this bitmap was created with.
    pub fn size(&self) -> u32 {
        self.size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn zero_size_is_immediately_complete() {
        let bm = ProdBitMap::new(0);
        assert!(bm.complete());
        assert_eq!(bm.count(), 0);
    }

    #[test]
    fn set_is_idempotent() {
        let bm = ProdBitMap::new(4);
        bm.set(1);
        bm.set(1);
        assert_eq!(bm.count(), 1);
        assert!(!bm.complete());
    }

    #[test]
    fn complete_once_all_bits_set() {
        let bm = ProdBitMap::new(3);
        bm.set(0);
        bm.set(1);
        assert!(!bm.complete());
        bm.set(2);
        assert!(bm.complete());
        assert_eq!(bm.count(), 3);
    }

    #[test]
    fn count_is_monotonic_under_concurrent_sets() {
        let bm = Arc::new(ProdBitMap::new(64));
        let mut handles = Vec::new();
        for t in 0..8 {
            let bm = Arc::clone(&bm);
            handles.push(thread::spawn(move || {
                for i in 0..8u32 {
                    bm.set(t * 8 + i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(bm.count(), 64);
        assert!(bm.complete());
    }
}
