//! Outbound request queue for the receiver's retransmission stream.
//! `RETX_END` completion acknowledgements are modeled as a fourth item kind
//! alongside the three `MISSING_*` requests so that every outbound frame
//! funnels through the one worker thread that owns the stream's write half
//! — see [`crate::receiver::conn`] for why a single writer is worth
//! keeping.

use crate::wire::{Flags, Header};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundKind {
    MissingBop,
    MissingData,
    MissingEop,
    RetxEnd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundItem {
    pub kind: OutboundKind,
    pub prodindex: u32,
    pub seqnum: u32,
    pub payloadlen: u16,
}

impl OutboundItem {
    pub fn missing_bop(prodindex: u32) -> OutboundItem {
        OutboundItem { kind: OutboundKind::MissingBop, prodindex, seqnum: 0, payloadlen: 0 }
    }

    pub fn missing_data(prodindex: u32, seqnum: u32, payloadlen: u16) -> OutboundItem {
        OutboundItem { kind: OutboundKind::MissingData, prodindex, seqnum, payloadlen }
    }

    pub fn missing_eop(prodindex: u32) -> OutboundItem {
        OutboundItem { kind: OutboundKind::MissingEop, prodindex, seqnum: 0, payloadlen: 0 }
    }

    pub fn retx_end(prodindex: u32) -> OutboundItem {
        OutboundItem { kind: OutboundKind::RetxEnd, prodindex, seqnum: 0, payloadlen: 0 }
    }

    pub fn to_header(self) -> Header {
        let flags = match self.kind {
            OutboundKind::MissingBop => Flags::BopReq,
            OutboundKind::MissingData => Flags::RetxReq,
            OutboundKind::MissingEop => Flags::EopReq,
            OutboundKind::RetxEnd => Flags::RetxEnd,
        };
        Header::new(self.prodindex, self.seqnum, self.payloadlen, flags)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disabled;

struct Inner {
    items: VecDeque<OutboundItem>,
    disabled: bool,
}

/// FIFO queue of outbound control frames. `pop_blocking` removes an item
/// as soon as it's handed to the caller; since the retransmission-request
/// worker is this queue's only consumer, it retries a failed send itself
/// (reconnecting as needed) rather than re-pushing, which is operationally
/// equivalent to "popped only after a successful send" from any other
/// thread's point of view.
pub struct RequestQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl RequestQueue {
    pub fn new() -> RequestQueue {
        RequestQueue { inner: Mutex::new(Inner { items: VecDeque::new(), disabled: false }), cond: Condvar::new() }
    }

    pub fn push(&self, item: OutboundItem) {
        let mut inner = self.inner.lock();
        inner.items.push_back(item);
        self.cond.notify_all();
    }

    /// Blocks until an item is available or the queue is disabled.
    pub fn pop_blocking(&self) -> Result<OutboundItem, Disabled> {
        let mut inner = self.inner.lock();
        loop {
            if inner.disabled {
                return Err(Disabled);
            }
            if let Some(item) = inner.items.pop_front() {
                return Ok(item);
            }
            self.cond.wait(&mut inner);
        }
    }

    /// Wakes any blocked waiter and fails every subsequent `pop_blocking`
    /// call. Idempotent.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = true;
        self.cond.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        RequestQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn push_then_pop_fifo_order() {
        let q = RequestQueue::new();
        q.push(OutboundItem::missing_bop(1));
        q.push(OutboundItem::missing_eop(2));
        assert_eq!(q.pop_blocking().unwrap().prodindex, 1);
        assert_eq!(q.pop_blocking().unwrap().prodindex, 2);
    }

    #[test]
    fn to_header_maps_kind_to_flags() {
        assert_eq!(OutboundItem::missing_bop(1).to_header().flags, Flags::BopReq);
        assert_eq!(OutboundItem::missing_data(1, 10, 20).to_header().flags, Flags::RetxReq);
        assert_eq!(OutboundItem::missing_eop(1).to_header().flags, Flags::EopReq);
        assert_eq!(OutboundItem::retx_end(1).to_header().flags, Flags::RetxEnd);
    }

    #[test]
    fn disable_wakes_blocked_waiter() {
        let q = Arc::new(RequestQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_blocking());
        thread::sleep(Duration::from_millis(20));
        q.disable();
        assert_eq!(handle.join().unwrap(), Err(Disabled));
    }
}
