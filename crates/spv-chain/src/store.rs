//! Tip persistence.
//!
//! The client only ever persists the best-known header, so the store is a
//! two-operation interface over a single keyed blob: the 80 wire bytes of
//! the header followed by its little-endian height.

use crate::error::{ChainError, ChainResult};
use crate::types::{BlockHeader, HEADER_WIRE_SIZE};
use std::path::Path;
use tracing::info;

const KEY_TIP: &[u8] = b"tip";
const TIP_RECORD_SIZE: usize = HEADER_WIRE_SIZE + 4;

/// Storage for the best-known chain tip.
pub trait TipStore: Send {
    /// Load the persisted tip, if any.
    fn load_tip(&self) -> ChainResult<Option<BlockHeader>>;

    /// Persist the tip, replacing any previous record.
    fn save_tip(&self, header: &BlockHeader) -> ChainResult<()>;
}

/// Sled-backed tip store.
pub struct SledTipStore {
    db: sled::Db,
}

impl SledTipStore {
    /// Open (or create) the store under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> ChainResult<Self> {
        let db = sled::open(path)?;
        info!("tip store opened");
        Ok(Self { db })
    }
}

impl TipStore for SledTipStore {
    fn load_tip(&self) -> ChainResult<Option<BlockHeader>> {
        let Some(raw) = self.db.get(KEY_TIP)? else {
            return Ok(None);
        };
        if raw.len() != TIP_RECORD_SIZE {
            return Err(ChainError::CorruptTip(format!(
                "expected {} bytes, found {}",
                TIP_RECORD_SIZE,
                raw.len()
            )));
        }
        let mut wire = [0u8; HEADER_WIRE_SIZE];
        wire.copy_from_slice(&raw[..HEADER_WIRE_SIZE]);
        let mut header = BlockHeader::from_wire_bytes(&wire);
        header.height = u32::from_le_bytes([raw[80], raw[81], raw[82], raw[83]]);
        Ok(Some(header))
    }

    fn save_tip(&self, header: &BlockHeader) -> ChainResult<()> {
        let mut record = Vec::with_capacity(TIP_RECORD_SIZE);
        record.extend_from_slice(&header.to_wire_bytes());
        record.extend_from_slice(&header.height.to_le_bytes());
        self.db.insert(KEY_TIP, record)?;
        self.db.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Network;
    use crate::types::Hash;
    use tempfile::tempdir;

    #[test]
    fn test_load_missing_tip() {
        let dir = tempdir().unwrap();
        let store = SledTipStore::open(dir.path()).unwrap();
        assert!(store.load_tip().unwrap().is_none());
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let store = SledTipStore::open(dir.path()).unwrap();

        let mut tip = BlockHeader {
            version: 2,
            prev_block: Network::Testnet.genesis().block_hash,
            merkle_root: Hash([0x42; 32]),
            timestamp: 1_700_000_000,
            bits: 0x1d00ffff,
            nonce: 99,
            height: 0,
            block_hash: Hash::ZERO,
        }
        .seal();
        tip.height = 1234;

        store.save_tip(&tip).unwrap();
        let loaded = store.load_tip().unwrap().expect("tip persisted");
        assert_eq!(loaded, tip);
        assert_eq!(loaded.height, 1234);
    }

    #[test]
    fn test_save_overwrites() {
        let dir = tempdir().unwrap();
        let store = SledTipStore::open(dir.path()).unwrap();

        let genesis = Network::Regtest.genesis();
        store.save_tip(&genesis).unwrap();
        let mut later = genesis.clone();
        later.nonce = 3;
        let mut later = later.seal();
        later.height = 7;
        store.save_tip(&later).unwrap();

        assert_eq!(store.load_tip().unwrap().unwrap(), later);
    }
}
