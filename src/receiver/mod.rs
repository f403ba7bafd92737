//! Receiver engine: joins the multicast group, maintains the current
//! product's state, detects loss from multicast gaps, and drives a
//! retransmission request/response pair of threads plus an EOP watchdog
//! thread, all against a single per-receiver TCP connection to the
//! sender.

mod conn;
mod state;
mod watchdog;

pub mod requests;

use crate::config::Config;
use crate::error::{EngineError, TransportError};
use crate::notify::ReceiverNotifier;
use crate::registry::{CancelToken, ExceptionCell, JoinRegistry};
use crate::transport::{datagram::PeekResult, McastReceiver, StreamConnection};
use crate::wire::{self, Flags, Header, DATA_LEN};
use conn::ReconnectCoordinator;
use requests::{OutboundItem, RequestQueue};
use state::{EopFlag, RxState};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use watchdog::EopWatchdog;

/// How often the multicast-ingest loop's bounded `peek` returns with
/// nothing pending, so it can recheck its cancellation flag.
const INGEST_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct Shared {
    config: Config,
    mcast: McastReceiver,
    state: RxState,
    eop_flag: EopFlag,
    missing_bop_set: parking_lot::Mutex<HashSet<u32>>,
    requests: RequestQueue,
    watchdog: EopWatchdog,
    notifier: Option<Arc<dyn ReceiverNotifier>>,
    exceptions: Arc<ExceptionCell>,
}

impl Shared {
    fn handle_bop(&self, prodindex: u32, payload: &[u8]) {
        let parsed = match wire::decode_bop_payload(payload) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("dropping malformed BOP for product {prodindex}: {e}");
                return;
            }
        };
        // A fresh BOP always supersedes whatever the watchdog was waiting
        // on for the previous product.
        self.watchdog.preempt();
        let buf = self.notifier.as_ref().and_then(|n| n.on_bop(parsed.prodsize, &parsed.metadata));
        let bitmap = Arc::new(crate::bitmap::ProdBitMap::new(wire::num_blocks(parsed.prodsize)));
        self.state.start_product(prodindex, parsed.prodsize, buf, Arc::clone(&bitmap));
        self.eop_flag.reset();
        self.watchdog.push(prodindex, self.config.eop_watchdog_seconds);
    }

    fn handle_data(&self, prodindex: u32, seqnum: u32, payload: &[u8]) {
        if let Some((low, high)) = self.state.apply_data(prodindex, seqnum, payload) {
            for (seq, len) in wire::gap_chunks(low, high) {
                self.requests.push(OutboundItem::missing_data(prodindex, seq, len));
            }
        }
    }

    fn emit_missing_bop_gap(&self, current: u32, new_prodindex: u32) {
        let mut skipped = wire::prodindexes_between(current, new_prodindex);
        skipped.push(new_prodindex);
        for idx in skipped {
            let mut set = self.missing_bop_set.lock();
            if set.insert(idx) {
                drop(set);
                self.requests.push(OutboundItem::missing_bop(idx));
            }
        }
    }

    fn handle_eop(&self, prodindex: u32) {
        let Some((complete, prodsize, high_water)) = self.state.eop_snapshot(prodindex) else {
            return;
        };
        if complete {
            self.requests.push(OutboundItem::retx_end(prodindex));
            if let Some(n) = &self.notifier {
                n.on_eop(prodindex);
            }
        } else if high_water < prodsize {
            for (seq, len) in wire::gap_chunks(high_water, prodsize) {
                self.requests.push(OutboundItem::missing_data(prodindex, seq, len));
            }
        }
    }

    /// `RETX_BOP`: carried bytes install the product same as a multicast
    /// BOP would, minus the watchdog preemption (the watchdog entry this
    /// product already has, from its own earlier `MISSING_BOP` cycle, is
    /// left alone). Because everything about this product was unknown
    /// until this frame, every byte and the EOP are certainly still
    /// missing.
    fn handle_retx_bop(&self, prodindex: u32, payload: &[u8]) {
        let parsed = match wire::decode_bop_payload(payload) {
            Ok(p) => p,
            Err(e) => {
                log::debug!("dropping malformed RETX_BOP for product {prodindex}: {e}");
                return;
            }
        };
        let buf = self.notifier.as_ref().and_then(|n| n.on_bop(parsed.prodsize, &parsed.metadata));
        let bitmap = Arc::new(crate::bitmap::ProdBitMap::new(wire::num_blocks(parsed.prodsize)));
        self.state.start_product(prodindex, parsed.prodsize, buf, Arc::clone(&bitmap));
        self.eop_flag.reset();
        self.missing_bop_set.lock().remove(&prodindex);
        for (seq, len) in wire::gap_chunks(0, parsed.prodsize) {
            self.requests.push(OutboundItem::missing_data(prodindex, seq, len));
        }
        self.requests.push(OutboundItem::missing_eop(prodindex));
    }

    fn handle_retx_data(&self, prodindex: u32, seqnum: u32, payload: &[u8]) {
        if self.state.apply_retx_data(prodindex, seqnum, payload) {
            self.requests.push(OutboundItem::retx_end(prodindex));
            if let Some(n) = &self.notifier {
                n.on_eop(prodindex);
            }
        }
    }
}

/// Receiver-side engine. Construct with [`ReceiverEngine::new`], call
/// [`ReceiverEngine::start`] once, then [`ReceiverEngine::stop`] when
/// done. All product delivery happens through the [`ReceiverNotifier`]
/// passed to `new`; there is no polling API.
pub struct ReceiverEngine {
    shared: Arc<Shared>,
    registry: JoinRegistry,
    started: AtomicBool,
    stopped: AtomicBool,
}

impl ReceiverEngine {
    /// Joins the multicast group but does not connect the TCP stream or
    /// start any threads yet — call [`ReceiverEngine::start`] for that.
    pub fn new(config: Config, notifier: Option<Arc<dyn ReceiverNotifier>>) -> Result<ReceiverEngine, EngineError> {
        let mcast = McastReceiver::join(config.mcast_addr, config.mcast_port)?;
        mcast.set_read_timeout(Some(INGEST_POLL_INTERVAL)).map_err(EngineError::Bind)?;
        Ok(ReceiverEngine {
            shared: Arc::new(Shared {
                state: RxState::new(config.initial_prodindex),
                eop_flag: EopFlag::new(),
                missing_bop_set: parking_lot::Mutex::new(HashSet::new()),
                requests: RequestQueue::new(),
                watchdog: EopWatchdog::new(),
                notifier,
                exceptions: Arc::new(ExceptionCell::new()),
                mcast,
                config,
            }),
            registry: JoinRegistry::new(),
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
        })
    }

    /// Dials the sender's TCP retransmission port (retrying indefinitely
    /// on transient errors), then spawns the EOP-watchdog,
    /// retransmission-request, retransmission-receive, and
    /// multicast-ingest threads in that order.
    pub fn start(&self) -> Result<(), EngineError> {
        self.started.store(true, Ordering::SeqCst);
        let coordinator = Arc::new(ReconnectCoordinator::new());
        let (_, _, gen0) =
            coordinator.ensure_fresh(self.shared.config.tcp_addr, self.shared.config.tcp_port, 0)?;

        self.spawn_watchdog_thread()?;
        self.spawn_request_thread(Arc::clone(&coordinator), gen0)?;
        self.spawn_retransmission_receive_thread(Arc::clone(&coordinator), gen0)?;
        self.spawn_ingest_thread()?;

        if let Some(err) = self.shared.exceptions.take() {
            return Err(err);
        }
        Ok(())
    }

    fn spawn_watchdog_thread(&self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let token = CancelToken::new();
        let handle = std::thread::Builder::new()
            .name("rmtp-receiver-watchdog".into())
            .spawn(move || loop {
                match shared.watchdog.pop_and_wait() {
                    Ok(prodindex) => {
                        if !shared.eop_flag.is_set() {
                            shared.requests.push(OutboundItem::missing_eop(prodindex));
                        }
                    }
                    Err(_disabled) => break,
                }
            })
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("watchdog", token, handle);
        Ok(())
    }

    fn spawn_request_thread(&self, coordinator: Arc<ReconnectCoordinator>, gen0: u64) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let addr = self.shared.config.tcp_addr;
        let port = self.shared.config.tcp_port;
        let token = CancelToken::new();
        let cancel = token.clone();
        let handle = std::thread::Builder::new()
            .name("rmtp-receiver-request".into())
            .spawn(move || {
                let (_, mut writer, mut gen) = match coordinator.ensure_fresh(addr, port, gen0) {
                    Ok(triple) => triple,
                    Err(e) => {
                        shared.exceptions.set_first(EngineError::Transport(e));
                        return;
                    }
                };
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let item = match shared.requests.pop_blocking() {
                        Ok(item) => item,
                        Err(_disabled) => break,
                    };
                    let header = item.to_header();
                    loop {
                        match writer.send_framed(&header, &[]) {
                            Ok(()) => break,
                            Err(e) => {
                                log::warn!("outbound send failed ({e}), reconnecting");
                                match coordinator.ensure_fresh(addr, port, gen) {
                                    Ok((_, new_writer, new_gen)) => {
                                        writer = new_writer;
                                        gen = new_gen;
                                    }
                                    Err(e) => {
                                        shared.exceptions.set_first(EngineError::Transport(e));
                                        return;
                                    }
                                }
                            }
                        }
                        if cancel.is_cancelled() {
                            return;
                        }
                    }
                }
            })
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("request", token, handle);
        Ok(())
    }

    fn spawn_retransmission_receive_thread(
        &self,
        coordinator: Arc<ReconnectCoordinator>,
        gen0: u64,
    ) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let addr = self.shared.config.tcp_addr;
        let port = self.shared.config.tcp_port;
        let token = CancelToken::new();
        let cancel = token.clone();
        let handle = std::thread::Builder::new()
            .name("rmtp-receiver-retx".into())
            .spawn(move || {
                let (mut reader, _, mut gen) = match coordinator.ensure_fresh(addr, port, gen0) {
                    Ok(triple) => triple,
                    Err(e) => {
                        shared.exceptions.set_first(EngineError::Transport(e));
                        return;
                    }
                };
                loop {
                    if cancel.is_cancelled() {
                        break;
                    }
                    let outcome = reader.recv_header().and_then(|header| dispatch_retx(&shared, &mut reader, &header));
                    match outcome {
                        Ok(()) => {}
                        Err(TransportError::PeerClosed) => {
                            log::info!("retransmission stream closed, reconnecting");
                            match coordinator.ensure_fresh(addr, port, gen) {
                                Ok((new_reader, _, new_gen)) => {
                                    reader = new_reader;
                                    gen = new_gen;
                                }
                                Err(e) => {
                                    shared.exceptions.set_first(EngineError::Transport(e));
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            log::warn!("retransmission-receive error ({e}), reconnecting");
                            match coordinator.ensure_fresh(addr, port, gen) {
                                Ok((new_reader, _, new_gen)) => {
                                    reader = new_reader;
                                    gen = new_gen;
                                }
                                Err(e) => {
                                    shared.exceptions.set_first(EngineError::Transport(e));
                                    return;
                                }
                            }
                        }
                    }
                }
            })
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("retx-receive", token, handle);
        Ok(())
    }

    fn spawn_ingest_thread(&self) -> Result<(), EngineError> {
        let shared = Arc::clone(&self.shared);
        let token = CancelToken::new();
        let cancel = token.clone();
        let handle = std::thread::Builder::new()
            .name("rmtp-receiver-ingest".into())
            .spawn(move || ingest_loop(&shared, &cancel))
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("ingest", token, handle);
        Ok(())
    }

    /// Disables the request queue and EOP watchdog (preemptible blocking
    /// points for two of the four worker threads), cancels all four
    /// threads, joins them, then rethrows any pending exception.
    /// Idempotent.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.shared.requests.disable();
        self.shared.watchdog.disable();
        self.registry.shutdown();
        if let Some(err) = self.shared.exceptions.take() {
            return Err(err);
        }
        Ok(())
    }
}

/// Multicast-ingest loop: peeks the next datagram's header, classifies it
/// by flags, and dispatches. `peek_header`'s bounded read timeout is this
/// loop's single designated blocking point, polled against `cancel`.
fn ingest_loop(shared: &Arc<Shared>, cancel: &CancelToken) {
    let mut scratch = [0u8; DATA_LEN];
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match shared.mcast.peek_header() {
            Ok(PeekResult::Header(header)) => dispatch_multicast(shared, &header, &mut scratch),
            Ok(PeekResult::UnknownFlags) => {
                let _ = shared.mcast.discard_next();
            }
            Err(e) if is_timeout(&e) => {}
            Err(e) => log::warn!("multicast peek failed: {e}"),
        }
    }
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

fn dispatch_multicast(shared: &Arc<Shared>, header: &Header, scratch: &mut [u8]) {
    match header.flags {
        Flags::Bop => match shared.mcast.read_into(scratch, 0) {
            Ok((h, n)) => shared.handle_bop(h.prodindex, &scratch[..n]),
            Err(e) => log::warn!("multicast read failed for BOP: {e}"),
        },
        Flags::MemData => {
            let current = shared.state.current_prodindex();
            if header.prodindex == current {
                match shared.mcast.read_into(scratch, 0) {
                    Ok((h, n)) => shared.handle_data(h.prodindex, h.seqnum, &scratch[..n]),
                    Err(e) => log::warn!("multicast read failed for MEM_DATA: {e}"),
                }
            } else {
                let _ = shared.mcast.discard_next();
                if wire::prodindex_after(header.prodindex, current) {
                    shared.emit_missing_bop_gap(current, header.prodindex);
                }
            }
        }
        Flags::Eop => {
            let _ = shared.mcast.discard_next();
            shared.eop_flag.set();
            shared.watchdog.preempt();
            shared.handle_eop(header.prodindex);
        }
        _ => {
            let _ = shared.mcast.discard_next();
        }
    }
}

/// Reads and dispatches one retransmission-stream frame whose header has
/// already been read. A `TransportError` propagated from here means the
/// stream's byte framing can no longer be trusted and the caller should
/// reconnect rather than keep reading.
fn dispatch_retx(shared: &Arc<Shared>, conn: &mut StreamConnection, header: &Header) -> Result<(), TransportError> {
    match header.flags {
        Flags::RetxBop => {
            let mut buf = vec![0u8; header.payloadlen as usize];
            conn.recv_payload_into(&mut buf, 0, header.payloadlen as usize)?;
            shared.handle_retx_bop(header.prodindex, &buf);
            Ok(())
        }
        Flags::RetxData => {
            let mut buf = vec![0u8; header.payloadlen as usize];
            conn.recv_payload_into(&mut buf, 0, header.payloadlen as usize)?;
            shared.handle_retx_data(header.prodindex, header.seqnum, &buf);
            Ok(())
        }
        Flags::RetxEop => {
            shared.handle_eop(header.prodindex);
            Ok(())
        }
        Flags::RetxRej => {
            shared.missing_bop_set.lock().remove(&header.prodindex);
            if let Some(n) = &shared.notifier {
                n.on_missed_prod(header.prodindex);
            }
            Ok(())
        }
        // Unknown/irrelevant flags on this stream are ignored, not fatal.
        _ => Ok(()),
    }
}
