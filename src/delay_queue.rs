//! Reveal-time delay queue: a priority queue of `(prodindex,
//! deadline)` pairs with a blocking `pop_when_ready`, backed by
//! `std::collections::BinaryHeap` guarded by `parking_lot::{Mutex, Condvar}`.

use parking_lot::{Condvar, Mutex};
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
struct Element {
    prodindex: u32,
    deadline: Instant,
}

// `BinaryHeap` is a max-heap; we want the earliest deadline popped first,
// so the ordering is reversed.
impl Ord for Element {
    fn cmp(&self, other: &Self) -> Ordering {
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for Element {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Inner {
    heap: BinaryHeap<Element>,
    disabled: bool,
}

/// Error returned by [`DelayQueue::pop_when_ready`] once the queue has
/// been [`DelayQueue::disable`]d.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disabled;

/// Thread-safe delay queue ordered by ascending deadline.
pub struct DelayQueue {
    inner: Mutex<Inner>,
    cond: Condvar,
}

impl DelayQueue {
    pub fn new() -> DelayQueue {
        DelayQueue {
            inner: Mutex::new(Inner { heap: BinaryHeap::new(), disabled: false }),
            cond: Condvar::new(),
        }
    }

    /// Inserts `prodindex` with a deadline `seconds_from_now` seconds in
    /// the future (may be negative-equivalent, i.e. already due, by
    /// passing `0.0` or a past-bound `Instant` in callers that compute it
    /// themselves). Wakes any thread blocked in `pop_when_ready`.
    pub fn push(&self, prodindex: u32, seconds_from_now: f64) {
        let deadline = if seconds_from_now <= 0.0 {
            Instant::now()
        } else {
            Instant::now() + Duration::from_secs_f64(seconds_from_now)
        };
        let mut inner = self.inner.lock();
        inner.heap.push(Element { prodindex, deadline });
        self.cond.notify_all();
    }

    /// Blocks until the earliest-deadline element's deadline has passed,
    /// then pops and returns its `prodindex`. Returns `Err(Disabled)` if
    /// the queue has been disabled, whether already-disabled at call time
    /// or disabled while waiting.
    pub fn pop_when_ready(&self) -> Result<u32, Disabled> {
        let mut inner = self.inner.lock();
        loop {
            if inner.disabled {
                return Err(Disabled);
            }
            match inner.heap.peek() {
                None => {
                    self.cond.wait(&mut inner);
                }
                Some(top) => {
                    let now = Instant::now();
                    if top.deadline <= now {
                        let elem = inner.heap.pop().expect("peeked element vanished");
                        return Ok(elem.prodindex);
                    }
                    let wait_for = top.deadline - now;
                    self.cond.wait_for(&mut inner, wait_for);
                }
            }
        }
    }

    /// Number of elements currently queued.
    pub fn size(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Disables the queue: wakes all waiters, and every subsequent
    /// `pop_when_ready` call fails immediately with `Disabled`. Idempotent.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = true;
        self.cond.notify_all();
    }
}

impl Default for DelayQueue {
    fn default() -> Self {
        DelayQueue::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn pop_never_returns_before_deadline() {
        let q = DelayQueue::new();
        q.push(7, 0.05);
        let start = Instant::now();
        let got = q.pop_when_ready().unwrap();
        assert_eq!(got, 7);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn earliest_deadline_pops_first() {
        let q = DelayQueue::new();
        q.push(1, 0.2);
        q.push(2, 0.01);
        q.push(3, 0.1);
        assert_eq!(q.pop_when_ready().unwrap(), 2);
        assert_eq!(q.pop_when_ready().unwrap(), 3);
        assert_eq!(q.pop_when_ready().unwrap(), 1);
    }

    #[test]
    fn disable_wakes_blocked_waiter_and_future_calls_fail() {
        let q = Arc::new(DelayQueue::new());
        let q2 = Arc::clone(&q);
        let handle = thread::spawn(move || q2.pop_when_ready());
        thread::sleep(Duration::from_millis(20));
        q.disable();
        assert_eq!(handle.join().unwrap(), Err(Disabled));
        assert_eq!(q.pop_when_ready(), Err(Disabled));
    }

    #[test]
    fn size_reflects_pending_count() {
        let q = DelayQueue::new();
        assert_eq!(q.size(), 0);
        q.push(1, 5.0);
        q.push(2, 5.0);
        assert_eq!(q.size(), 2);
    }
}
