//! Weir node binary.
//!
//! Runs the peer manager over an in-memory chain and mempool with a plain
//! TCP transport. Useful for exercising the sync engine against other nodes
//! and for local multi-node experiments.

mod transport;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};
use weir_core::constants::NetworkType;
use weir_core::memory::MemoryChain;
use weir_core::traits::SystemClock;
use weir_network::{ConnectionType, PeerManager, PeerManagerConfig, SyncService};

use crate::transport::{TcpConnman, accept_loop, dial};

/// Name of the optional JSON config file inside the data directory.
const CONFIG_FILE: &str = "weir.json";
/// How often we look at whether to open more outbound connections.
const CONNECT_INTERVAL: Duration = Duration::from_secs(30);

/// Weir sync node.
#[derive(Parser, Debug)]
#[command(name = "weir-node", version, about = "Weir peer-to-peer sync node")]
struct Args {
    /// Data directory for the config file
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// JSON file with peer manager settings (defaults to <data-dir>/weir.json if present)
    #[arg(long)]
    config: Option<PathBuf>,

    /// P2P listen address
    #[arg(long, default_value = "0.0.0.0")]
    listen_addr: String,

    /// P2P listen port (defaults to the network's port)
    #[arg(long)]
    port: Option<u16>,

    /// Peers to connect to (comma-separated host:port)
    #[arg(long, value_delimiter = ',')]
    connect: Vec<SocketAddr>,

    /// Outbound full-relay connections to maintain
    #[arg(long, default_value_t = 8)]
    max_outbound: usize,

    /// Do not relay or request loose transactions
    #[arg(long)]
    blocks_only: bool,

    /// Offer bloom-filtered connections
    #[arg(long)]
    peer_bloom_filters: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Log output format ("text" or "json")
    #[arg(long, default_value = "text")]
    log_format: String,

    /// Use the test network
    #[arg(long, conflicts_with = "regtest")]
    testnet: bool,

    /// Use the local regression-test network
    #[arg(long, conflicts_with = "testnet")]
    regtest: bool,
}

impl Args {
    fn network(&self) -> NetworkType {
        if self.regtest {
            NetworkType::Regtest
        } else if self.testnet {
            NetworkType::Testnet
        } else {
            NetworkType::Mainnet
        }
    }

    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("weir")
                .join(self.network().data_dir_suffix())
        })
    }

    /// File settings first, then command-line flags on top.
    fn peer_config(&self) -> Result<PeerManagerConfig> {
        let path = self.config.clone().or_else(|| {
            let default = self.data_dir().join(CONFIG_FILE);
            default.exists().then_some(default)
        });
        let mut config = match path {
            Some(path) => load_config(&path)?,
            None => PeerManagerConfig::default(),
        };
        let network = self.network();
        config.magic = network.magic_bytes();
        config.blocks_only |= self.blocks_only;
        config.enable_bloom_filters |= self.peer_bloom_filters;
        config.validate().context("invalid peer manager settings")?;
        Ok(config)
    }

    fn listen(&self) -> Result<SocketAddr> {
        let port = self.port.unwrap_or_else(|| self.network().default_p2p_port());
        format!("{}:{port}", self.listen_addr)
            .parse()
            .with_context(|| format!("invalid listen address '{}'", self.listen_addr))
    }
}

fn load_config(path: &Path) -> Result<PeerManagerConfig> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read '{}'", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid config '{}'", path.display()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level, &args.log_format);

    let config = args.peer_config().context("failed to load configuration")?;
    let listen = args.listen()?;

    info!("Weir node v{}", env!("CARGO_PKG_VERSION"));
    info!(network = ?args.network(), data_dir = %args.data_dir().display(), %listen, "starting");

    let clock = Arc::new(SystemClock);
    let chain = Arc::new(MemoryChain::new(clock.clone()));
    let connman = Arc::new(TcpConnman::new(config.magic, args.max_outbound, None));
    let manager = PeerManager::new(config, chain.clone(), chain.clone(), chain, connman.clone(), clock)
        .context("invalid configuration")?;
    let manager = Arc::new(manager);
    let (service, driver) = SyncService::start(manager);
    let service = Arc::new(service);

    let listener = tokio::net::TcpListener::bind(listen)
        .await
        .with_context(|| format!("failed to bind {listen}"))?;
    info!(%listen, "listening for peers");
    tokio::spawn(accept_loop(listener, connman.clone(), service.clone()));

    for addr in &args.connect {
        tokio::spawn(dial(*addr, ConnectionType::Manual, connman.clone(), service.clone()));
    }

    let connector = {
        let connman = connman.clone();
        let service = service.clone();
        async move {
            let mut ticker = tokio::time::interval(CONNECT_INTERVAL);
            loop {
                ticker.tick().await;
                if !connman.wants_extra_outbound() {
                    continue;
                }
                match connman.pick_address() {
                    Some(addr) => {
                        info!(%addr, "opening extra outbound connection");
                        tokio::spawn(dial(addr, ConnectionType::Outbound, connman.clone(), service.clone()));
                    }
                    None => warn!("stale tip but no address to try"),
                }
            }
        }
    };

    tokio::select! {
        _ = connector => {}
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!("failed to listen for Ctrl+C: {e}");
            }
            info!("shutdown signal received");
        }
    }

    service.shutdown();
    if let Err(e) = driver.await {
        error!("sync service task failed: {e}");
    }
    info!("Weir node shutdown complete");
    Ok(())
}

/// Initialize tracing with the given level and output format.
///
/// `RUST_LOG` takes precedence over `level_str`. Pass `format = "json"` for
/// structured output; anything else gives human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry().with(filter).with(fmt::layer().json()).init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true))
            .init();
    }
}
