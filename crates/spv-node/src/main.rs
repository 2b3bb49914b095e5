//! SPV header-sync client.
//!
//! Joins the peer-to-peer network, follows the block header chain, and
//! persists the best-known tip. This is the main entry point for the
//! spv-node binary.

use anyhow::{Context, Result};
use clap::Parser;
use spv_chain::{Chain, SledTipStore, TipStore};
use spv_net::{Client, ClientConfig, ConnectionConfig};
use std::path::PathBuf;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

mod config;

use config::NodeConfig;

/// Headers-only client for a proof-of-work network.
#[derive(Parser, Debug)]
#[command(name = "spv-node")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "spv.toml")]
    pub config: PathBuf,

    /// Network to join (mainnet, testnet, regtest)
    #[arg(short, long)]
    pub network: Option<String>,

    /// Data directory for the persisted chain tip
    #[arg(short, long)]
    pub datadir: Option<PathBuf>,

    /// Target outbound connection count
    #[arg(long)]
    pub max_connections: Option<usize>,

    /// User agent advertised to peers
    #[arg(long)]
    pub user_agent: Option<String>,

    /// Enable debug-level logging
    #[arg(long)]
    pub debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = NodeConfig::load(&args.config, &args)?;

    let level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("starting spv-node v{}", env!("CARGO_PKG_VERSION"));

    let network = config.network()?;
    info!(%network, datadir = %config.datadir.display(), "configuration loaded");

    std::fs::create_dir_all(&config.datadir).context("failed to create data directory")?;
    let store = SledTipStore::open(config.datadir.join("chain")).context("failed to open tip store")?;

    // A persisted tip seeds the chain as a checkpoint; otherwise start at
    // the genesis header.
    let chain = match store.load_tip()? {
        Some(tip) if tip.block_hash != network.genesis().block_hash => {
            info!(tip = %tip, "resuming from persisted tip");
            Chain::from_checkpoint(network, tip)
        }
        _ => Chain::new(network),
    };

    let client_config = ClientConfig {
        max_connections: config.max_connections,
        known_peers: config.peer_addrs()?,
        connection: ConnectionConfig {
            magic: network.magic(),
            protocol_version: config.protocol_version,
            user_agent: config.user_agent.clone(),
            ..Default::default()
        },
        ..ClientConfig::for_network(network)
    };

    let mut client = Client::new(client_config, chain, Some(Box::new(store)));

    tokio::select! {
        result = client.run() => {
            if let Err(e) = result {
                tracing::error!("client error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    client.shutdown().await;
    info!(height = client.chain().height(), "spv-node stopped");
    Ok(())
}
