//! Node configuration.

use crate::Args;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use spv_chain::Network;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

/// Complete node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Network to join (mainnet, testnet, regtest).
    #[serde(default = "default_network")]
    pub network: String,
    /// Data directory for the persisted chain tip.
    #[serde(default = "default_datadir")]
    pub datadir: PathBuf,
    /// Target outbound connection count.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// User agent advertised in the `version` message.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Protocol version to advertise.
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
    /// Statically configured peers, dialed before DNS results arrive.
    #[serde(default)]
    pub known_peers: Vec<String>,
    /// Debug-level logging.
    #[serde(default)]
    pub debug: bool,
}

fn default_network() -> String {
    "testnet".to_string()
}

fn default_datadir() -> PathBuf {
    PathBuf::from(".spv")
}

fn default_max_connections() -> usize {
    spv_net::DEFAULT_MAX_CONNECTIONS
}

fn default_user_agent() -> String {
    concat!("/spv:", env!("CARGO_PKG_VERSION"), "/").to_string()
}

fn default_protocol_version() -> i32 {
    spv_chain::PROTOCOL_VERSION
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            network: default_network(),
            datadir: default_datadir(),
            max_connections: default_max_connections(),
            user_agent: default_user_agent(),
            protocol_version: default_protocol_version(),
            known_peers: Vec::new(),
            debug: false,
        }
    }
}

impl NodeConfig {
    /// Load configuration from the file (when present) and apply CLI
    /// overrides on top.
    pub fn load(config_path: &Path, args: &Args) -> Result<Self> {
        let mut config = if config_path.exists() {
            let content =
                std::fs::read_to_string(config_path).context("failed to read config file")?;
            toml::from_str(&content).context("failed to parse config file")?
        } else {
            Self::default()
        };

        if let Some(ref network) = args.network {
            config.network = network.clone();
        }
        if let Some(ref datadir) = args.datadir {
            config.datadir = datadir.clone();
        }
        if let Some(max_connections) = args.max_connections {
            config.max_connections = max_connections;
        }
        if let Some(ref user_agent) = args.user_agent {
            config.user_agent = user_agent.clone();
        }
        if args.debug {
            config.debug = true;
        }

        Ok(config)
    }

    /// The parsed network.
    pub fn network(&self) -> Result<Network> {
        self.network
            .parse()
            .map_err(|e: String| anyhow::anyhow!(e))
    }

    /// Statically configured peers as socket addresses.
    pub fn peer_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.known_peers
            .iter()
            .map(|s| {
                s.parse()
                    .with_context(|| format!("invalid peer address: {}", s))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_args() -> Args {
        Args {
            config: PathBuf::from("spv.toml"),
            network: None,
            datadir: None,
            max_connections: None,
            user_agent: None,
            debug: false,
        }
    }

    #[test]
    fn test_defaults_when_no_file() {
        let config = NodeConfig::load(Path::new("/nonexistent/spv.toml"), &no_args()).unwrap();
        assert_eq!(config.network, "testnet");
        assert_eq!(config.max_connections, spv_net::DEFAULT_MAX_CONNECTIONS);
        assert!(config.user_agent.starts_with("/spv:"));
        assert_eq!(config.network().unwrap(), Network::Testnet);
    }

    #[test]
    fn test_cli_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spv.toml");
        std::fs::write(&path, "network = \"mainnet\"\nmax_connections = 4\n").unwrap();

        let mut args = no_args();
        args.network = Some("regtest".to_string());
        args.debug = true;

        let config = NodeConfig::load(&path, &args).unwrap();
        assert_eq!(config.network, "regtest");
        assert_eq!(config.max_connections, 4);
        assert!(config.debug);
    }

    #[test]
    fn test_bad_network_rejected() {
        let mut config = NodeConfig::default();
        config.network = "signet".to_string();
        assert!(config.network().is_err());
    }

    #[test]
    fn test_peer_addrs_parse() {
        let mut config = NodeConfig::default();
        config.known_peers = vec!["127.0.0.1:18444".to_string()];
        assert_eq!(config.peer_addrs().unwrap().len(), 1);

        config.known_peers = vec!["not-an-addr".to_string()];
        assert!(config.peer_addrs().is_err());
    }
}
