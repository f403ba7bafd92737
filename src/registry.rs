//! Thread registry & exception pipe: tracks worker-thread handles for an
//! engine instance, provides cooperative cancellation via a shared flag per
//! worker, and a single-slot "first exception" cell that
//! `start`/`stop`/`send_product` check and rethrow from. One reusable type
//! shared by both the sender and receiver engines, so neither engine's
//! worker closures need a direct cyclic reference back to their owner.

use crate::error::EngineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// A cooperative cancellation flag shared between a worker and its
/// registry entry. Workers check this only at their single designated
/// blocking point per loop iteration.
#[derive(Clone)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken { flag: Arc::new(AtomicBool::new(false)) }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        CancelToken::new()
    }
}

/// Single-slot "first exception" cell. Only the first `EngineError`
/// reported wins; subsequent reports are dropped.
#[derive(Default)]
pub struct ExceptionCell {
    slot: Mutex<Option<EngineError>>,
}

impl ExceptionCell {
    pub fn new() -> ExceptionCell {
        ExceptionCell { slot: Mutex::new(None) }
    }

    /// Records `err` if no exception has been recorded yet.
    pub fn set_first(&self, err: EngineError) {
        let mut slot = self.slot.lock();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Takes the recorded exception, if any, leaving the cell empty.
    pub fn take(&self) -> Option<EngineError> {
        self.slot.lock().take()
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

/// Registers worker threads for an engine instance and joins/cancels them
/// together on shutdown. `shutdown()` is idempotent.
#[derive(Default)]
pub struct JoinRegistry {
    workers: Mutex<Vec<(String, CancelToken, JoinHandle<()>)>>,
}

impl JoinRegistry {
    pub fn new() -> JoinRegistry {
        JoinRegistry { workers: Mutex::new(Vec::new()) }
    }

    /// Registers a spawned worker under `name`, along with the
    /// [`CancelToken`] it was given so `shutdown` can cancel it.
    pub fn register(&self, name: impl Into<String>, token: CancelToken, handle: JoinHandle<()>) {
        self.workers.lock().push((name.into(), token, handle));
    }

    /// Cancels every registered worker and joins them all. Safe to call
    /// more than once; the second call is a no-op since the worker list is
    /// drained on the first call.
    pub fn shutdown(&self) {
        let workers = std::mem::take(&mut *self.workers.lock());
        for (_, token, _) in &workers {
            token.cancel();
        }
        for (name, _, handle) in workers {
            if handle.join().is_err() {
                log::error!("worker thread '{name}' panicked");
            }
        }
    }

    /// Number of workers currently registered (for tests/diagnostics).
    pub fn len(&self) -> usize {
        self.workers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[test]
    fn exception_cell_keeps_first_only() {
        let cell = ExceptionCell::new();
        cell.set_first(EngineError::NullPayload);
        cell.set_first(EngineError::StoppedEngine);
        match cell.take() {
            Some(EngineError::NullPayload) => {}
            other => panic!("expected NullPayload, got {other:?}"),
        }
        assert!(cell.take().is_none());
    }

    #[test]
    fn registry_cancels_and_joins_workers() {
        let registry = JoinRegistry::new();
        let ran = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let token = CancelToken::new();
            let ran = Arc::clone(&ran);
            let worker_token = token.clone();
            let handle = std::thread::spawn(move || {
                while !worker_token.is_cancelled() {
                    std::thread::sleep(Duration::from_millis(1));
                }
                ran.fetch_add(1, Ordering::SeqCst);
            });
            registry.register("worker", token, handle);
        }
        assert_eq!(registry.len(), 3);
        registry.shutdown();
        assert_eq!(ran.load(Ordering::SeqCst), 3);
        assert!(registry.is_empty());
        // Idempotent.
        registry.shutdown();
    }
}
