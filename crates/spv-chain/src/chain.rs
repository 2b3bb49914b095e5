//! In-memory header chain.
//!
//! Headers live in an arena indexed by block hash. Each node links to its
//! parent by arena index, so tip search is a cached lookup rather than a
//! tree walk, and the structure tolerates short-lived forks: the tip is the
//! first-seen header of maximum height.

use crate::params::Network;
use crate::types::{BlockHeader, Hash};
use crate::TIP_RECENT_SECS;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Outcome of offering a header to the chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New header connected to a known parent.
    Inserted,
    /// Header hash already present; no-op.
    Duplicate,
    /// Parent unknown; the header was dropped.
    Orphan,
}

struct ChainNode {
    header: BlockHeader,
    parent: Option<usize>,
}

/// Forest of block headers with a single root.
///
/// The root is normally the genesis header; when a persisted tip is used as
/// a checkpoint, the root is that tip instead and `locator()` still
/// terminates with the genesis hash.
pub struct Chain {
    nodes: Vec<ChainNode>,
    index: HashMap<Hash, usize>,
    tip: usize,
    genesis_hash: Hash,
}

impl Chain {
    /// Create a chain rooted at the network's genesis header.
    pub fn new(network: Network) -> Self {
        let genesis = network.genesis();
        let genesis_hash = genesis.block_hash;
        Self::with_root(genesis, genesis_hash)
    }

    /// Create a chain rooted at a previously persisted tip.
    ///
    /// The root keeps its stored height; headers build forward from it.
    pub fn from_checkpoint(network: Network, checkpoint: BlockHeader) -> Self {
        let genesis_hash = network.genesis().block_hash;
        Self::with_root(checkpoint, genesis_hash)
    }

    fn with_root(root: BlockHeader, genesis_hash: Hash) -> Self {
        let root_hash = root.block_hash;
        let mut index = HashMap::new();
        index.insert(root_hash, 0);
        Chain {
            nodes: vec![ChainNode {
                header: root,
                parent: None,
            }],
            index,
            tip: 0,
            genesis_hash,
        }
    }

    /// The deepest known header.
    pub fn tip(&self) -> &BlockHeader {
        &self.nodes[self.tip].header
    }

    /// Height of the tip.
    pub fn height(&self) -> u32 {
        self.tip().height
    }

    /// Number of headers held, including the root.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True when no headers beyond the root are known.
    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    /// Whether a header with this hash is present.
    pub fn has_block(&self, hash: &Hash) -> bool {
        self.index.contains_key(hash)
    }

    /// Insert a header whose parent is already present.
    ///
    /// The height is assigned from the parent; the tip moves only on a
    /// strictly greater height, so ties keep the first-seen branch. Orphans
    /// are dropped: the caller re-requests and the chain reconverges.
    pub fn put_block_header(&mut self, mut header: BlockHeader) -> InsertOutcome {
        if self.index.contains_key(&header.block_hash) {
            return InsertOutcome::Duplicate;
        }
        let parent_idx = match self.index.get(&header.prev_block) {
            Some(&idx) => idx,
            None => {
                debug!(hash = %header.block_hash, prev = %header.prev_block, "dropping orphan header");
                return InsertOutcome::Orphan;
            }
        };

        header.height = self.nodes[parent_idx].header.height + 1;
        let idx = self.nodes.len();
        self.index.insert(header.block_hash, idx);
        let new_height = header.height;
        self.nodes.push(ChainNode {
            header,
            parent: Some(parent_idx),
        });
        if new_height > self.nodes[self.tip].header.height {
            self.tip = idx;
        }
        InsertOutcome::Inserted
    }

    /// Whether the tip timestamp is within the recency window of `now`.
    pub fn tip_is_recent_at(&self, now_secs: u64) -> bool {
        let age = now_secs as i64 - self.tip().timestamp as i64;
        age < TIP_RECENT_SECS as i64
    }

    /// Whether the tip timestamp is within the recency window of wall-clock
    /// time.
    pub fn tip_is_recent(&self) -> bool {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.tip_is_recent_at(now)
    }

    /// Block locator for `getheaders`: the tip, its nine closest ancestors,
    /// then exponentially spaced ancestors, ending with the genesis hash.
    pub fn locator(&self) -> Vec<Hash> {
        let mut hashes = Vec::with_capacity(32);
        let mut step = 1usize;
        let mut cursor = Some(self.tip);

        while let Some(idx) = cursor {
            hashes.push(self.nodes[idx].header.block_hash);
            if hashes.len() >= 10 {
                step *= 2;
            }
            let mut next = Some(idx);
            for _ in 0..step {
                next = next.and_then(|n| self.nodes[n].parent);
                if next.is_none() {
                    break;
                }
            }
            // A stride past the root still contributes the root itself.
            if next.is_none() && self.nodes[idx].parent.is_some() {
                next = Some(0);
            }
            cursor = next;
        }

        if hashes.last() != Some(&self.genesis_hash) {
            hashes.push(self.genesis_hash);
        }
        hashes
    }
}
