//! CLI product receiver: reads a `Config`, starts a [`rmtp::ReceiverEngine`],
//! and writes each completed product to `<out_dir>/<prodindex>.bin`, running
//! until interrupted.

use clap::Parser;
use parking_lot::Mutex;
use rmtp::{Config, EngineError, ReceiveBuffer, ReceiverEngine, ReceiverNotifier};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rmtp-recv", about = "Receive RMTP products and write each to a file")]
struct Args {
    /// Path to a TOML configuration file. Unset fields fall back to
    /// Config::default().
    #[arg(long)]
    config: Option<PathBuf>,

    /// Multicast group address, overrides the config file.
    #[arg(long)]
    mcast_addr: Option<std::net::Ipv4Addr>,

    /// Multicast group port, overrides the config file.
    #[arg(long)]
    mcast_port: Option<u16>,

    /// Directory completed products are written into, named `<prodindex>.bin`.
    #[arg(long, default_value = "./received")]
    out_dir: PathBuf,
}

/// Growable destination handed to the engine for the currently-open
/// product. RMTP only ever tracks one "current" product at a time, so the
/// buffer most recently returned from `on_bop` is always the one `on_eop`
/// refers to.
struct FileBuffer {
    data: Arc<Mutex<Vec<u8>>>,
}

impl ReceiveBuffer for FileBuffer {
    fn write_at(&mut self, offset: u32, bytes: &[u8]) {
        let mut data = self.data.lock();
        let start = offset as usize;
        data[start..start + bytes.len()].copy_from_slice(bytes);
    }

    fn len(&self) -> u32 {
        self.data.lock().len() as u32
    }
}

struct FileNotifier {
    out_dir: PathBuf,
    pending: Mutex<Option<Arc<Mutex<Vec<u8>>>>>,
}

impl FileNotifier {
    fn new(out_dir: PathBuf) -> FileNotifier {
        FileNotifier { out_dir, pending: Mutex::new(None) }
    }
}

impl ReceiverNotifier for FileNotifier {
    fn on_bop(&self, prodsize: u32, metadata: &[u8]) -> Option<Box<dyn ReceiveBuffer>> {
        log::debug!("BOP: {prodsize} bytes, {} bytes of metadata", metadata.len());
        let data = Arc::new(Mutex::new(vec![0u8; prodsize as usize]));
        *self.pending.lock() = Some(Arc::clone(&data));
        Some(Box::new(FileBuffer { data }))
    }

    fn on_eop(&self, prodindex: u32) {
        let Some(data) = self.pending.lock().take() else {
            return;
        };
        let path = self.out_dir.join(format!("{prodindex}.bin"));
        match std::fs::write(&path, &*data.lock()) {
            Ok(()) => log::info!("product {prodindex} written to {}", path.display()),
            Err(e) => log::error!("failed to write product {prodindex} to {}: {e}", path.display()),
        }
    }

    fn on_missed_prod(&self, prodindex: u32) {
        log::warn!("product {prodindex} declared missed, giving up on recovery");
        self.pending.lock().take();
    }
}

fn load_config(args: &Args) -> std::io::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };
    if let Some(addr) = args.mcast_addr {
        config.mcast_addr = addr;
    }
    if let Some(port) = args.mcast_port {
        config.mcast_port = port;
    }
    Ok(config)
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    std::fs::create_dir_all(&args.out_dir)?;

    let notifier = Arc::new(FileNotifier::new(args.out_dir.clone()));
    let engine = ReceiverEngine::new(config, Some(notifier))?;
    engine.start()?;
    log::info!("receiver started, writing products to {}", args.out_dir.display());

    // Worker threads run detached from this one; block here until the
    // process is killed (SIGINT/SIGTERM). There is no graceful in-process
    // shutdown path from the CLI; `ReceiverEngine::stop` exists for
    // embedders that hold their own handle to the engine.
    loop {
        std::thread::sleep(std::time::Duration::from_secs(3600));
    }
}

fn main() {
    env_logger::init();
    if let Err(e) = run() {
        if let Some(engine_err) = e.downcast_ref::<EngineError>() {
            log::error!("fatal engine error: {engine_err}");
        } else {
            log::error!("{e}");
        }
        std::process::exit(1);
    }
}
