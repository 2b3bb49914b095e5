//! Hash and block-header wire types.
//!
//! Hashes are kept in wire byte order (the order they are serialized in),
//! which is the reverse of the conventional hex display order. `Display`
//! performs the reversal, so `Hash::from_display_hex` and `to_string` are
//! inverses.

use crate::error::ChainError;
use sha2::{Digest, Sha256};
use std::fmt;

/// Serialized size of a block header on the wire.
pub const HEADER_WIRE_SIZE: usize = 80;

/// A 32-byte block or transaction hash in wire byte order.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// The reserved all-zero hash.
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Construct from raw wire-order bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Hash(bytes)
    }

    /// Parse from display-order (big-endian) hex, as printed by block
    /// explorers. The byte order is reversed into wire order.
    pub fn from_display_hex(s: &str) -> Result<Self, ChainError> {
        let raw = hex::decode(s).map_err(|e| ChainError::InvalidHashHex(e.to_string()))?;
        let mut bytes: [u8; 32] = raw
            .try_into()
            .map_err(|_| ChainError::InvalidHashHex(format!("wrong length: {}", s.len())))?;
        bytes.reverse();
        Ok(Hash(bytes))
    }

    /// Raw wire-order bytes.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// True for the reserved zero hash.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; 32]
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut rev = self.0;
        rev.reverse();
        write!(f, "{}", hex::encode(rev))
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Double SHA-256, the proof-of-work hash function.
pub fn dsha256(data: &[u8]) -> Hash {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    Hash(second.into())
}

/// An 80-byte block header plus locally derived fields.
///
/// `height` is not on the wire; the chain assigns it when the header is
/// connected to its parent. `block_hash` is derived from the wire bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block version.
    pub version: i32,
    /// Hash of the previous block header.
    pub prev_block: Hash,
    /// Merkle root of the block's transactions.
    pub merkle_root: Hash,
    /// Block timestamp, seconds since the epoch.
    pub timestamp: u32,
    /// Compact difficulty target.
    pub bits: u32,
    /// Proof-of-work nonce.
    pub nonce: u32,
    /// Height in the local chain; 0 until connected.
    pub height: u32,
    /// Double SHA-256 of the 80 wire bytes.
    pub block_hash: Hash,
}

impl BlockHeader {
    /// Serialize the six wire fields in order.
    pub fn to_wire_bytes(&self) -> [u8; HEADER_WIRE_SIZE] {
        let mut buf = [0u8; HEADER_WIRE_SIZE];
        buf[0..4].copy_from_slice(&self.version.to_le_bytes());
        buf[4..36].copy_from_slice(self.prev_block.as_bytes());
        buf[36..68].copy_from_slice(self.merkle_root.as_bytes());
        buf[68..72].copy_from_slice(&self.timestamp.to_le_bytes());
        buf[72..76].copy_from_slice(&self.bits.to_le_bytes());
        buf[76..80].copy_from_slice(&self.nonce.to_le_bytes());
        buf
    }

    /// Parse from the 80 wire bytes, deriving `block_hash`.
    pub fn from_wire_bytes(bytes: &[u8; HEADER_WIRE_SIZE]) -> Self {
        let version = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let mut prev = [0u8; 32];
        prev.copy_from_slice(&bytes[4..36]);
        let mut merkle = [0u8; 32];
        merkle.copy_from_slice(&bytes[36..68]);
        let timestamp = u32::from_le_bytes([bytes[68], bytes[69], bytes[70], bytes[71]]);
        let bits = u32::from_le_bytes([bytes[72], bytes[73], bytes[74], bytes[75]]);
        let nonce = u32::from_le_bytes([bytes[76], bytes[77], bytes[78], bytes[79]]);

        BlockHeader {
            version,
            prev_block: Hash(prev),
            merkle_root: Hash(merkle),
            timestamp,
            bits,
            nonce,
            height: 0,
            block_hash: dsha256(bytes),
        }
    }

    /// Recompute `block_hash` after constructing or mutating wire fields.
    pub fn seal(mut self) -> Self {
        self.block_hash = dsha256(&self.to_wire_bytes());
        self
    }
}

impl fmt::Display for BlockHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (height {})", self.block_hash, self.height)
    }
}
