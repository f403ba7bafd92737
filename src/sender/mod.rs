//! Sender engine: multicasts products, accepts TCP connections from
//! receivers, runs a per-receiver retransmission service thread each, and
//! a retention-timer thread that releases unacknowledged products after a
//! grace period.

pub mod retention;
mod retransmit;

use crate::config::Config;
use crate::delay_queue::DelayQueue;
use crate::error::EngineError;
use crate::notify::SenderNotifier;
use crate::rate_shaper::RateShaper;
use crate::registry::{CancelToken, ExceptionCell, JoinRegistry};
use crate::transport::{McastSender, StreamListener};
use crate::wire::{self, Flags, Header, DATA_LEN, META_MAX};
use retention::{RetentionEntry, RetentionMap};
use retransmit::ServiceContext;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Serializes a full product's BOP/data/EOP emission and the rate shaper
/// that paces it, so that concurrent `send_product` callers from multiple
/// application threads never interleave one product's packets with
/// another's.
struct Emitter {
    rate_shaper: parking_lot::Mutex<RateShaper>,
}

/// Sender-side engine. Construct with [`SenderEngine::new`], call
/// [`SenderEngine::start`] once, then drive [`SenderEngine::send_product`]
/// from one or more application threads, and [`SenderEngine::stop`] when
/// done.
pub struct SenderEngine {
    config: Config,
    mcast: McastSender,
    listener: Arc<StreamListener>,
    retention: Arc<RetentionMap>,
    delay_queue: Arc<DelayQueue>,
    registry: JoinRegistry,
    exceptions: Arc<ExceptionCell>,
    notifier: Option<Arc<dyn SenderNotifier>>,
    next_prodindex: AtomicU32,
    next_stream_id: Arc<AtomicU64>,
    connected: Arc<parking_lot::Mutex<HashSet<u64>>>,
    emitter: Emitter,
    stopped: AtomicBool,
    started: AtomicBool,
    accept_cancel: CancelToken,
}

impl SenderEngine {
    /// Opens the multicast send endpoint and the TCP listener, but does
    /// not yet start any threads — call [`SenderEngine::start`] for that.
    pub fn new(config: Config, notifier: Option<Arc<dyn SenderNotifier>>) -> Result<SenderEngine, EngineError> {
        let mcast = McastSender::open(
            config.mcast_addr,
            config.mcast_port,
            config.multicast_ttl,
            config.iface_addr,
        )?;
        let listener = StreamListener::bind_and_listen(config.tcp_addr, config.tcp_port)
            .map_err(|e| match e {
                crate::error::TransportError::Io(io) => EngineError::Bind(io),
                other => EngineError::Transport(other),
            })?;
        let mut rate_shaper = RateShaper::new();
        rate_shaper.set_rate(config.rate_bps);
        Ok(SenderEngine {
            next_prodindex: AtomicU32::new(config.initial_prodindex),
            config,
            mcast,
            listener: Arc::new(listener),
            retention: Arc::new(RetentionMap::new()),
            delay_queue: Arc::new(DelayQueue::new()),
            registry: JoinRegistry::new(),
            exceptions: Arc::new(ExceptionCell::new()),
            notifier,
            next_stream_id: Arc::new(AtomicU64::new(0)),
            connected: Arc::new(parking_lot::Mutex::new(HashSet::new())),
            emitter: Emitter { rate_shaper: parking_lot::Mutex::new(rate_shaper) },
            stopped: AtomicBool::new(false),
            started: AtomicBool::new(false),
            accept_cancel: CancelToken::new(),
        })
    }

    /// The TCP port the sender ended up listening on (useful when the
    /// configured `tcp_port` was `0`).
    pub fn tcp_port(&self) -> std::io::Result<u16> {
        self.listener.local_port()
    }

    /// Starts the retention-timer thread and the accept/coordinator
    /// thread. Idempotent-in-spirit but intended to be called exactly
    /// once; calling it twice spawns a second set of threads.
    pub fn start(&self) -> Result<(), EngineError> {
        self.started.store(true, Ordering::SeqCst);
        self.spawn_timer_thread()?;
        self.spawn_accept_thread()?;
        if let Some(err) = self.exceptions.take() {
            return Err(err);
        }
        Ok(())
    }

    fn spawn_timer_thread(&self) -> Result<(), EngineError> {
        let delay_queue = Arc::clone(&self.delay_queue);
        let retention = Arc::clone(&self.retention);
        let notifier = self.notifier.clone();
        let exceptions = Arc::clone(&self.exceptions);
        let token = CancelToken::new();
        let handle = std::thread::Builder::new()
            .name("rmtp-sender-timer".into())
            .spawn(move || {
                loop {
                    match delay_queue.pop_when_ready() {
                        Ok(prodindex) => {
                            if retention.remove(prodindex) {
                                if let Some(n) = &notifier {
                                    n.on_eop(prodindex);
                                }
                            }
                        }
                        Err(_disabled) => break,
                    }
                }
                let _ = &exceptions;
            })
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("timer", token, handle);
        Ok(())
    }

    fn spawn_accept_thread(&self) -> Result<(), EngineError> {
        let listener = Arc::clone(&self.listener);
        let registry_handle = SenderEngineWorkerHandles {
            retention: Arc::clone(&self.retention),
            notifier: self.notifier.clone(),
            connected: Arc::clone(&self.connected),
        };
        let exceptions = Arc::clone(&self.exceptions);
        let token = self.accept_cancel.clone();

        // Accept is a blocking syscall with no portable cooperative-cancel
        // primitive in safe std; we poll it non-blocking instead, checked
        // against `token` once per iteration, which matches the "single
        // blocking point per loop iteration" shape with a bounded poll
        // interval rather than a true blocking wait.
        listener.set_nonblocking(true).map_err(EngineError::Bind)?;
        let spawn_one: SpawnConnectionFn = Box::new(move |conn, stream_id, cancel| {
            let ctx = Arc::new(ServiceContext {
                retention: Arc::clone(&registry_handle.retention),
                notifier: registry_handle.notifier.clone(),
                connected: Arc::clone(&registry_handle.connected),
            });
            registry_handle.connected.lock().insert(stream_id);
            std::thread::Builder::new()
                .name(format!("rmtp-sender-retx-{stream_id}"))
                .spawn(move || retransmit::run_service(conn, stream_id, ctx, cancel))
        });
        let stream_id_counter = Arc::clone(&self.next_stream_id);

        let handle = std::thread::Builder::new()
            .name("rmtp-sender-accept".into())
            .spawn(move || {
                accept_loop(listener, token, exceptions, spawn_one, stream_id_counter);
            })
            .map_err(EngineError::ThreadSpawn)?;
        self.registry.register("accept", self.accept_cancel.clone(), handle);
        Ok(())
    }

    /// Synchronously sends one product: records a retention entry, then
    /// emits BOP, all data blocks (rate-shaped if configured), and EOP, in
    /// order. Returns the `prodindex` assigned to this product, after
    /// which the internal counter advances (wrapping at `u32::MAX`).
    pub fn send_product(&self, payload: &[u8], metadata: &[u8]) -> Result<u32, EngineError> {
        if let Some(err) = self.exceptions.take() {
            return Err(err);
        }
        if self.stopped.load(Ordering::SeqCst) {
            return Err(EngineError::StoppedEngine);
        }
        if metadata.len() > META_MAX {
            return Err(EngineError::MetadataTooLarge { size: metadata.len(), max: META_MAX });
        }
        let prodlen = payload.len() as u32;
        let prodindex = self.next_prodindex.fetch_add(1, Ordering::SeqCst);

        let pending = self.connected.lock().clone();
        let entry = RetentionEntry::new(
            prodindex,
            prodlen,
            Arc::from(metadata),
            Arc::from(payload),
            pending,
            Instant::now(),
        );
        self.retention.add(entry);

        self.emit_bop(prodindex, prodlen, metadata)?;
        self.emit_data(prodindex, payload)?;
        self.emit_eop(prodindex)?;

        self.delay_queue.push(prodindex, self.config.retention_seconds);
        Ok(prodindex)
    }

    fn emit_bop(&self, prodindex: u32, prodlen: u32, metadata: &[u8]) -> Result<(), EngineError> {
        let payload = wire::encode_bop_payload(prodlen, metadata);
        let header = Header::new(prodindex, 0, payload.len() as u16, Flags::Bop);
        self.mcast.send_gather(&header, &payload).map_err(|e| EngineError::Transport(e.into()))
    }

    fn emit_data(&self, prodindex: u32, payload: &[u8]) -> Result<(), EngineError> {
        let shaping = self.config.rate_bps > 0;
        let mut off = 0u32;
        let total = payload.len() as u32;
        while off < total {
            let size = (total - off).min(DATA_LEN as u32);
            let block = &payload[off as usize..(off as usize + size as usize)];
            let header = Header::new(prodindex, off, size as u16, Flags::MemData);
            if shaping {
                let mut shaper = self.emitter.rate_shaper.lock();
                shaper.start_packet(crate::wire::HEADER_LEN + block.len());
                self.mcast.send_gather(&header, block).map_err(|e| EngineError::Transport(e.into()))?;
                shaper.end_packet_and_sleep();
            } else {
                self.mcast.send_gather(&header, block).map_err(|e| EngineError::Transport(e.into()))?;
            }
            off += size;
        }
        Ok(())
    }

    fn emit_eop(&self, prodindex: u32) -> Result<(), EngineError> {
        let header = Header::new(prodindex, 0, 0, Flags::Eop);
        self.mcast.send_gather(&header, &[]).map_err(|e| EngineError::Transport(e.into()))
    }

    /// Disables the delay queue (stopping the timer thread), cancels the
    /// accept thread and all per-connection retransmission threads, joins
    /// everything, then rethrows any pending exception. Idempotent.
    pub fn stop(&self) -> Result<(), EngineError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.delay_queue.disable();
        self.accept_cancel.cancel();
        self.registry.shutdown();
        if let Some(err) = self.exceptions.take() {
            return Err(err);
        }
        Ok(())
    }
}

struct SenderEngineWorkerHandles {
    retention: Arc<RetentionMap>,
    notifier: Option<Arc<dyn SenderNotifier>>,
    connected: Arc<parking_lot::Mutex<HashSet<u64>>>,
}

type SpawnConnectionFn = Box<
    dyn Fn(
            crate::transport::StreamConnection,
            u64,
            CancelToken,
        ) -> std::io::Result<std::thread::JoinHandle<()>>
        + Send,
>;

fn accept_loop(
    listener: Arc<StreamListener>,
    cancel: CancelToken,
    exceptions: Arc<ExceptionCell>,
    spawn_one: SpawnConnectionFn,
    stream_ids: Arc<AtomicU64>,
) {
    let mut sub_registry: Vec<(CancelToken, std::thread::JoinHandle<()>)> = Vec::new();
    loop {
        if cancel.is_cancelled() {
            break;
        }
        match listener.accept() {
            Ok(conn) => {
                let stream_id = stream_ids.fetch_add(1, Ordering::SeqCst);
                let conn_cancel = CancelToken::new();
                match spawn_one(conn, stream_id, conn_cancel.clone()) {
                    Ok(handle) => sub_registry.push((conn_cancel, handle)),
                    Err(e) => {
                        log::error!("failed to spawn retx service thread: {e}");
                        exceptions.set_first(EngineError::ThreadSpawn(e));
                    }
                }
            }
            Err(crate::error::TransportError::Io(e))
                if e.kind() == std::io::ErrorKind::WouldBlock =>
            {
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
            Err(e) => {
                log::warn!("accept failed: {e}");
                std::thread::sleep(std::time::Duration::from_millis(20));
            }
        }
    }
    for (token, _) in &sub_registry {
        token.cancel();
    }
    for (_, handle) in sub_registry {
        let _ = handle.join();
    }
}
