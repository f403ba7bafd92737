//! Receiver-side current-product state: high-water header, parsed BOP
//! metadata, the application's receive buffer, and the block bitmap, all
//! guarded by a single mutex. [`EopFlag`] guards `eop_received`
//! separately, since the watchdog thread reads it independently of
//! everything else here.

use crate::bitmap::ProdBitMap;
use crate::notify::ReceiveBuffer;
use crate::wire;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;

/// Parsed BOP payload retained for the current product.
struct BopInfo {
    prodsize: u32,
}

struct Inner {
    current_prodindex: u32,
    high_water: u32,
    bop: Option<BopInfo>,
    prodptr: Option<Box<dyn ReceiveBuffer>>,
    bitmap: Option<Arc<ProdBitMap>>,
}

/// Guards the fields a receiver tracks for whichever product is "current":
/// the high-water byte offset, the declared product size, the
/// application's destination buffer (or `None` in discard mode), and the
/// block bitmap.
pub struct RxState {
    inner: Mutex<Inner>,
}

impl RxState {
    /// `initial_prodindex` is the first product the sender will assign;
    /// `current_prodindex` starts one behind it so the first BOP or data
    /// packet the receiver sees for that product is correctly treated as
    /// "after" the (nonexistent) current one.
    pub fn new(initial_prodindex: u32) -> RxState {
        RxState {
            inner: Mutex::new(Inner {
                current_prodindex: initial_prodindex.wrapping_sub(1),
                high_water: 0,
                bop: None,
                prodptr: None,
                bitmap: None,
            }),
        }
    }

    pub fn current_prodindex(&self) -> u32 {
        self.inner.lock().current_prodindex
    }

    /// Installs a freshly-parsed BOP as the current product, discarding
    /// whatever was tracked for the previous one.
    pub fn start_product(
        &self,
        prodindex: u32,
        prodsize: u32,
        prodptr: Option<Box<dyn ReceiveBuffer>>,
        bitmap: Arc<ProdBitMap>,
    ) {
        let mut inner = self.inner.lock();
        inner.current_prodindex = prodindex;
        inner.high_water = 0;
        inner.bop = Some(BopInfo { prodsize });
        inner.prodptr = prodptr;
        inner.bitmap = Some(bitmap);
    }

    /// Applies a multicast data block to the current product if
    /// `prodindex` still matches it: writes into the application buffer
    /// (if any), sets the corresponding bitmap bit, advances the
    /// high-water mark, and returns the block-aligned byte gap (if any)
    /// between the previous high-water mark and this block's start. A
    /// block whose `seqnum`/`payload` would run past the product's
    /// declared size is dropped silently, as if the datagram never
    /// arrived, rather than writing or indexing out of bounds.
    pub fn apply_data(&self, prodindex: u32, seqnum: u32, payload: &[u8]) -> Option<(u32, u32)> {
        let mut inner = self.inner.lock();
        if inner.current_prodindex != prodindex {
            return None;
        }
        if payload.is_empty() {
            return None;
        }
        let prodsize = inner.bop.as_ref().map(|b| b.prodsize).unwrap_or(0);
        let end = seqnum.checked_add(payload.len() as u32)?;
        if end > prodsize {
            return None;
        }
        if let Some(ptr) = inner.prodptr.as_deref_mut() {
            ptr.write_at(seqnum, payload);
        }
        if let Some(bm) = &inner.bitmap {
            bm.set(wire::block_index(seqnum));
        }
        let gap = if seqnum > inner.high_water { Some((inner.high_water, seqnum)) } else { None };
        if end > inner.high_water {
            inner.high_water = end;
        }
        gap
    }

    /// Applies a retransmitted data block to the current product,
    /// unconditionally on top of whatever has already arrived. Returns
    /// `true` iff the bitmap became complete as a result. A block whose
    /// `seqnum`/`payload` would run past the product's declared size is
    /// dropped silently, same as [`RxState::apply_data`].
    pub fn apply_retx_data(&self, prodindex: u32, seqnum: u32, payload: &[u8]) -> bool {
        let mut inner = self.inner.lock();
        if inner.current_prodindex != prodindex {
            return false;
        }
        if payload.is_empty() {
            return false;
        }
        let prodsize = inner.bop.as_ref().map(|b| b.prodsize).unwrap_or(0);
        let Some(end) = seqnum.checked_add(payload.len() as u32) else {
            return false;
        };
        if end > prodsize {
            return false;
        }
        if let Some(ptr) = inner.prodptr.as_deref_mut() {
            ptr.write_at(seqnum, payload);
        }
        match &inner.bitmap {
            Some(bm) => {
                bm.set(wire::block_index(seqnum));
                bm.complete()
            }
            None => false,
        }
    }

    /// Snapshot the EOP handler needs: whether the bitmap (if any) is
    /// complete, the declared product size, and the current high-water
    /// mark. Returns `None` if `prodindex` is no longer the current
    /// product (a stale EOP for a product already superseded by a later
    /// BOP).
    pub fn eop_snapshot(&self, prodindex: u32) -> Option<(bool, u32, u32)> {
        let inner = self.inner.lock();
        if inner.current_prodindex != prodindex {
            return None;
        }
        let complete = inner.bitmap.as_ref().map(|b| b.complete()).unwrap_or(true);
        let prodsize = inner.bop.as_ref().map(|b| b.prodsize).unwrap_or(0);
        Some((complete, prodsize, inner.high_water))
    }
}

/// `eop_received`: guarded by its own mutex+condvar, separate from
/// [`RxState`] since the BOP/EOP handlers and the watchdog thread need to
/// touch it independently of the rest of the product state.
pub struct EopFlag {
    inner: Mutex<bool>,
    cond: Condvar,
}

impl EopFlag {
    pub fn new() -> EopFlag {
        EopFlag { inner: Mutex::new(false), cond: Condvar::new() }
    }

    pub fn set(&self) {
        let mut g = self.inner.lock();
        *g = true;
        self.cond.notify_all();
    }

    pub fn reset(&self) {
        *self.inner.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.lock()
    }
}

impl Default for EopFlag {
    fn default() -> Self {
        EopFlag::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::VecBuffer;

    #[test]
    fn current_prodindex_starts_one_behind_initial() {
        let state = RxState::new(10);
        assert_eq!(state.current_prodindex(), 9);
        assert!(wire::prodindex_after(10, state.current_prodindex()));
    }

    #[test]
    fn apply_data_ignores_stale_prodindex() {
        let state = RxState::new(0);
        state.start_product(5, 10, Some(Box::new(VecBuffer::new(10))), Arc::new(ProdBitMap::new(1)));
        assert!(state.apply_data(4, 0, &[1, 2, 3]).is_none());
    }

    #[test]
    fn apply_data_reports_gap_and_advances_high_water() {
        let state = RxState::new(0);
        state.start_product(5, 3000, Some(Box::new(VecBuffer::new(3000))), Arc::new(ProdBitMap::new(3)));
        assert_eq!(state.apply_data(5, 0, &[0u8; 100]), None);
        let gap = state.apply_data(5, 200, &[0u8; 50]);
        assert_eq!(gap, Some((100, 200)));
    }

    #[test]
    fn apply_data_drops_a_block_that_overruns_prodsize() {
        let state = RxState::new(0);
        state.start_product(5, 100, Some(Box::new(VecBuffer::new(100))), Arc::new(ProdBitMap::new(1)));
        // seqnum + payload.len() = 90 + 50 = 140 > prodsize(100).
        assert_eq!(state.apply_data(5, 90, &[0u8; 50]), None);
        assert_eq!(state.eop_snapshot(5), Some((false, 100, 0)));
    }

    #[test]
    fn apply_retx_data_drops_a_block_that_overruns_prodsize() {
        let state = RxState::new(0);
        state.start_product(5, 100, Some(Box::new(VecBuffer::new(100))), Arc::new(ProdBitMap::new(1)));
        assert!(!state.apply_retx_data(5, 90, &[0u8; 50]));
    }

    #[test]
    fn eop_snapshot_reflects_bitmap_completeness() {
        let state = RxState::new(0);
        let bitmap = Arc::new(ProdBitMap::new(1));
        state.start_product(1, 10, None, Arc::clone(&bitmap));
        assert_eq!(state.eop_snapshot(1), Some((false, 10, 0)));
        bitmap.set(0);
        assert_eq!(state.eop_snapshot(1), Some((true, 10, 0)));
        assert_eq!(state.eop_snapshot(2), None);
    }

    #[test]
    fn eop_flag_set_and_reset() {
        let flag = EopFlag::new();
        assert!(!flag.is_set());
        flag.set();
        assert!(flag.is_set());
        flag.reset();
        assert!(!flag.is_set());
    }
}
