//! Single-writer/single-reader reconnect coordination for the receiver's
//! retransmission stream. The retransmission-request worker is the
//! stream's only writer (see [`crate::receiver::requests`] for why every
//! outbound frame, including `RETX_END`, funnels through it) and the
//! retransmission-receive worker is its only reader; each holds an
//! independent `TcpStream` clone of the same connection. When either
//! notices the peer has gone away, whichever one gets there first redials
//! (via `StreamConnection::connect`'s indefinite retry); the other just
//! picks up the fresh clone that dial installed instead of redialing a
//! second time.

use crate::error::TransportError;
use crate::transport::StreamConnection;
use parking_lot::Mutex;
use std::net::Ipv4Addr;

struct Inner {
    reader: StreamConnection,
    writer: StreamConnection,
    generation: u64,
}

pub struct ReconnectCoordinator {
    inner: Mutex<Option<Inner>>,
}

impl ReconnectCoordinator {
    pub fn new() -> ReconnectCoordinator {
        ReconnectCoordinator { inner: Mutex::new(None) }
    }

    /// Returns a fresh `(reader, writer, generation)` triple. If `seen_gen`
    /// still matches the coordinator's current generation (including the
    /// very first call, before any connection exists), this caller is the
    /// first to notice the break and performs the actual redial; since
    /// `StreamConnection::connect` retries forever on transient errors,
    /// this only returns `Err` for a non-retryable one. Otherwise another
    /// thread already reconnected, and this call just clones the
    /// connection that thread installed.
    pub fn ensure_fresh(
        &self,
        addr: Ipv4Addr,
        port: u16,
        seen_gen: u64,
    ) -> Result<(StreamConnection, StreamConnection, u64), TransportError> {
        let mut guard = self.inner.lock();
        let needs_dial = match &*guard {
            Some(inner) => inner.generation == seen_gen,
            None => true,
        };
        if needs_dial {
            let reader = StreamConnection::connect(addr, port)?;
            let writer = reader.try_clone()?;
            let generation = guard.as_ref().map(|i| i.generation + 1).unwrap_or(1);
            *guard = Some(Inner { reader, writer, generation });
        }
        let inner = guard.as_ref().expect("just installed above");
        Ok((inner.reader.try_clone()?, inner.writer.try_clone()?, inner.generation))
    }
}

impl Default for ReconnectCoordinator {
    fn default() -> Self {
        ReconnectCoordinator::new()
    }
}
