//! EOP watchdog: a one-entry-at-a-time FIFO of `(prodindex,
//! timeout_seconds)` deadlines, each waited on with a preemptible
//! condition variable. FIFO rather than priority-ordered, since only one
//! outstanding watchdog entry is ever meaningfully active: a fresh BOP
//! preempts whatever the watchdog is waiting on for the product it
//! superseded.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Disabled;

struct Inner {
    queue: VecDeque<(u32, f64)>,
    disabled: bool,
}

/// FIFO queue of per-product EOP deadlines. `pop_and_wait` blocks for up
/// to the popped entry's recorded timeout, waking early if
/// [`EopWatchdog::preempt`] is called in the meantime, and returns the
/// entry's `prodindex` either way. The `eop_received` check belongs to the
/// caller; this type has no opinion on why it woke.
pub struct EopWatchdog {
    inner: Mutex<Inner>,
    has_item: Condvar,
    preempted: Condvar,
}

impl EopWatchdog {
    pub fn new() -> EopWatchdog {
        EopWatchdog {
            inner: Mutex::new(Inner { queue: VecDeque::new(), disabled: false }),
            has_item: Condvar::new(),
            preempted: Condvar::new(),
        }
    }

    pub fn push(&self, prodindex: u32, seconds: f64) {
        let mut inner = self.inner.lock();
        inner.queue.push_back((prodindex, seconds));
        self.has_item.notify_all();
    }

    /// Wakes whatever `pop_and_wait` call is currently mid-wait, without
    /// touching the queue. Called by the BOP handler (a new product
    /// preempts the previous one's deadline) and the EOP handler (the
    /// product's own EOP arrived).
    pub fn preempt(&self) {
        let _inner = self.inner.lock();
        self.preempted.notify_all();
    }

    /// Wakes any blocked waiter and fails every subsequent `pop_and_wait`
    /// call. Idempotent.
    pub fn disable(&self) {
        let mut inner = self.inner.lock();
        inner.disabled = true;
        self.has_item.notify_all();
        self.preempted.notify_all();
    }

    pub fn pop_and_wait(&self) -> Result<u32, Disabled> {
        let mut inner = self.inner.lock();
        loop {
            if inner.disabled {
                return Err(Disabled);
            }
            match inner.queue.pop_front() {
                None => self.has_item.wait(&mut inner),
                Some((prodindex, seconds)) => {
                    let dur = Duration::from_secs_f64(seconds.max(0.0));
                    self.preempted.wait_for(&mut inner, dur);
                    return Ok(prodindex);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

impl Default for EopWatchdog {
    fn default() -> Self {
        EopWatchdog::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Instant;

    #[test]
    fn returns_after_timeout_when_never_preempted() {
        let wd = EopWatchdog::new();
        wd.push(9, 0.05);
        let start = Instant::now();
        assert_eq!(wd.pop_and_wait().unwrap(), 9);
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[test]
    fn preempt_wakes_a_blocked_wait_early() {
        let wd = Arc::new(EopWatchdog::new());
        wd.push(3, 5.0);
        let wd2 = Arc::clone(&wd);
        let handle = thread::spawn(move || {
            let start = Instant::now();
            let got = wd2.pop_and_wait().unwrap();
            (got, start.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        wd.preempt();
        let (got, elapsed) = handle.join().unwrap();
        assert_eq!(got, 3);
        assert!(elapsed < Duration::from_millis(500));
    }

    #[test]
    fn disable_wakes_blocked_waiter() {
        let wd = Arc::new(EopWatchdog::new());
        let wd2 = Arc::clone(&wd);
        let handle = thread::spawn(move || wd2.pop_and_wait());
        thread::sleep(Duration::from_millis(20));
        wd.disable();
        assert_eq!(handle.join().unwrap(), Err(Disabled));
    }
}
