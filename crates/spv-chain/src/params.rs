//! Network parameters.
//!
//! Each supported network selects its wire magic, default P2P port, DNS seed
//! hostnames and genesis header. The genesis hashes are pinned by tests
//! against the well-known explorer values.

use crate::types::{BlockHeader, Hash};
use std::fmt;
use std::str::FromStr;

/// Protocol version advertised in the `version` message.
pub const PROTOCOL_VERSION: i32 = 70001;

/// Merkle root of the genesis coinbase, shared by all three networks.
const GENESIS_MERKLE_ROOT: &str =
    "4a5e1e4baab89f3a32518a88c31bc87f618f76673e2cc77ab2127b7afdeda33b";

/// DNS seeds for mainnet.
pub const MAINNET_DNS_SEEDS: &[&str] = &[
    "seed.bitcoin.sipa.be",
    "dnsseed.bluematt.me",
    "dnsseed.bitcoin.dashjr.org",
    "seed.bitcoinstats.com",
];

/// DNS seeds for testnet.
pub const TESTNET_DNS_SEEDS: &[&str] = &[
    "testnet-seed.bitcoin.jonasschnelli.ch",
    "seed.tbtc.petertodd.org",
    "testnet-seed.bluematt.me",
];

/// The network a client instance participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    /// Wire magic identifying this network, little-endian on the wire.
    pub fn magic(&self) -> u32 {
        match self {
            Network::Mainnet => 0xD9B4BEF9,
            Network::Testnet => 0x0709110B,
            Network::Regtest => 0xDAB5BFFA,
        }
    }

    /// Default P2P port.
    pub fn default_port(&self) -> u16 {
        match self {
            Network::Mainnet => 8333,
            Network::Testnet => 18333,
            Network::Regtest => 18444,
        }
    }

    /// DNS seed hostnames for bootstrapping. Regtest has none.
    pub fn dns_seeds(&self) -> &'static [&'static str] {
        match self {
            Network::Mainnet => MAINNET_DNS_SEEDS,
            Network::Testnet => TESTNET_DNS_SEEDS,
            Network::Regtest => &[],
        }
    }

    /// The genesis block header, at height 0.
    pub fn genesis(&self) -> BlockHeader {
        let (timestamp, bits, nonce) = match self {
            Network::Mainnet => (1231006505, 0x1d00ffff, 2083236893),
            Network::Testnet => (1296688602, 0x1d00ffff, 414098458),
            Network::Regtest => (1296688602, 0x207fffff, 2),
        };
        BlockHeader {
            version: 1,
            prev_block: Hash::ZERO,
            merkle_root: Hash::from_display_hex(GENESIS_MERKLE_ROOT)
                .expect("valid genesis merkle root hex"),
            timestamp,
            bits,
            nonce,
            height: 0,
            block_hash: Hash::ZERO,
        }
        .seal()
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for Network {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mainnet" => Ok(Network::Mainnet),
            "testnet" => Ok(Network::Testnet),
            "regtest" => Ok(Network::Regtest),
            other => Err(format!("unknown network: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mainnet_genesis_hash() {
        let genesis = Network::Mainnet.genesis();
        assert_eq!(
            genesis.block_hash.to_string(),
            "000000000019d6689c085ae165831e934ff763ae46a2a6c172b3f1b60a8ce26f"
        );
        assert_eq!(genesis.height, 0);
    }

    #[test]
    fn test_testnet_genesis_hash() {
        let genesis = Network::Testnet.genesis();
        assert_eq!(
            genesis.block_hash.to_string(),
            "000000000933ea01ad0ee984209779baaec3ced90fa3f408719526f8d77f4943"
        );
    }

    #[test]
    fn test_regtest_genesis_hash() {
        let genesis = Network::Regtest.genesis();
        assert_eq!(
            genesis.block_hash.to_string(),
            "0f9188f13cb7b2c71f2a335e3a4fc328bf5beb436012afca590b1a11466e2206"
        );
    }

    #[test]
    fn test_network_parse() {
        assert_eq!("testnet".parse::<Network>().unwrap(), Network::Testnet);
        assert!("signet".parse::<Network>().is_err());
    }

    #[test]
    fn test_ports_and_seeds() {
        assert_eq!(Network::Mainnet.default_port(), 8333);
        assert_eq!(Network::Testnet.default_port(), 18333);
        assert!(!Network::Testnet.dns_seeds().is_empty());
        assert!(Network::Regtest.dns_seeds().is_empty());
    }
}
