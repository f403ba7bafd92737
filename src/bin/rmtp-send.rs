//! CLI product sender: reads a `Config`, starts a [`rmtp::SenderEngine`],
//! and multicasts one product per file argument (or one product read whole
//! from stdin if none are given).

use clap::Parser;
use rmtp::{Config, EngineError, SenderEngine, SenderNotifier};
use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "rmtp-send", about = "Multicast one or more products over RMTP")]
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

    /// Files to send as products, in order. If none are given, one product
    /// is read from stdin.
    files: Vec<PathBuf>,
}

struct LoggingNotifier;

impl SenderNotifier for LoggingNotifier {
    fn on_eop(&self, prodindex: u32) {
        log::info!("product {prodindex} fully acknowledged or released");
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

fn read_products(args: &Args) -> std::io::Result<Vec<Vec<u8>>> {
    if args.files.is_empty() {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf)?;
        return Ok(vec![buf]);
    }
    args.files.iter().map(std::fs::read).collect()
}

fn run() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let config = load_config(&args)?;
    let products = read_products(&args)?;

    let engine = SenderEngine::new(config, Some(Arc::new(LoggingNotifier)))?;
    engine.start()?;
    log::info!("sender started, tcp port {}", engine.tcp_port()?);

    for (i, product) in products.iter().enumerate() {
        let prodindex = engine.send_product(product, &[])?;
        log::info!("sent product {prodindex} ({} bytes, input #{i})", product.len());
    }

    engine.stop()?;
    Ok(())
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
