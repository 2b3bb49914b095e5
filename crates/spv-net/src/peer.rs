//! Peer identity and the address book.

use crate::message::NetAddr;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::net::SocketAddr;

/// Identity of a remote peer, completed by its `version` message.
#[derive(Debug, Clone)]
pub struct Peer {
    /// Socket address of the peer.
    pub addr: SocketAddr,
    /// Service bitmap the peer advertised.
    pub services: u64,
    /// Protocol version the peer advertised.
    pub version: i32,
    /// Peer user agent.
    pub user_agent: String,
    /// Best height the peer claimed at handshake time.
    pub start_height: i32,
    /// Nonce from the peer's `version` message.
    pub nonce: u64,
}

impl Peer {
    /// A peer known only by address, before its `version` arrives.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            services: 0,
            version: 0,
            user_agent: String::new(),
            start_height: 0,
            nonce: 0,
        }
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.user_agent.is_empty() {
            write!(f, "{}", self.addr)
        } else {
            write!(f, "{} ({})", self.addr, self.user_agent)
        }
    }
}

/// Candidate peer addresses, split by provenance.
///
/// Addresses learned from `addr` gossip are preferred over DNS seed
/// results when choosing the next peer to dial.
#[derive(Default)]
pub struct PeerBook {
    known: HashMap<SocketAddr, NetAddr>,
    seeds: HashSet<SocketAddr>,
}

impl PeerBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a DNS seed result.
    pub fn add_seed(&mut self, addr: SocketAddr) {
        self.seeds.insert(addr);
    }

    /// Record a gossiped address. Returns true when it is new.
    pub fn add_known(&mut self, entry: NetAddr) -> bool {
        self.known.insert(entry.addr, entry).is_none()
    }

    /// Drop a gossiped address, typically after its connection failed.
    pub fn remove_known(&mut self, addr: &SocketAddr) -> bool {
        self.known.remove(addr).is_some()
    }

    /// Number of gossiped addresses held.
    pub fn known_len(&self) -> usize {
        self.known.len()
    }

    /// Number of seed addresses held.
    pub fn seed_len(&self) -> usize {
        self.seeds.len()
    }

    /// Uniform-random candidate not in `exclude`, gossiped addresses first.
    pub fn select(&self, exclude: &HashSet<SocketAddr>) -> Option<SocketAddr> {
        let known: Vec<SocketAddr> = self
            .known
            .keys()
            .filter(|addr| !exclude.contains(addr))
            .copied()
            .collect();
        if let Some(addr) = known.choose(&mut rand::thread_rng()) {
            return Some(*addr);
        }

        let seeds: Vec<SocketAddr> = self
            .seeds
            .iter()
            .filter(|addr| !exclude.contains(addr))
            .copied()
            .collect();
        seeds.choose(&mut rand::thread_rng()).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net_addr(port: u16) -> NetAddr {
        NetAddr {
            time: 0,
            services: 0,
            addr: format!("127.0.0.1:{}", port).parse().unwrap(),
        }
    }

    #[test]
    fn test_known_preferred_over_seeds() {
        let mut book = PeerBook::new();
        book.add_seed("127.0.0.1:1000".parse().unwrap());
        book.add_known(net_addr(2000));

        for _ in 0..16 {
            let chosen = book.select(&HashSet::new()).unwrap();
            assert_eq!(chosen.port(), 2000);
        }
    }

    #[test]
    fn test_select_excludes_connected() {
        let mut book = PeerBook::new();
        let a = net_addr(2000);
        book.add_known(a);

        let mut exclude = HashSet::new();
        exclude.insert(a.addr);
        assert!(book.select(&exclude).is_none());

        book.add_seed("127.0.0.1:1000".parse().unwrap());
        assert_eq!(book.select(&exclude).unwrap().port(), 1000);
    }

    #[test]
    fn test_duplicate_gossip_not_new() {
        let mut book = PeerBook::new();
        assert!(book.add_known(net_addr(2000)));
        assert!(!book.add_known(net_addr(2000)));
        assert_eq!(book.known_len(), 1);
    }

    #[test]
    fn test_remove_known() {
        let mut book = PeerBook::new();
        let a = net_addr(2000);
        book.add_known(a);
        assert!(book.remove_known(&a.addr));
        assert!(!book.remove_known(&a.addr));
        assert!(book.select(&HashSet::new()).is_none());
    }
}
