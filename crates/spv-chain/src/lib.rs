//! # spv-chain
//!
//! Block-header chain model for an SPV client.
//!
//! This crate provides:
//! - `Hash` and `BlockHeader` wire types with double-SHA-256 hashing
//! - Network parameters (magic, ports, DNS seeds, genesis headers)
//! - An in-memory header forest with tip tracking and locator generation
//! - Tip persistence behind the `TipStore` trait

mod chain;
mod error;
mod params;
mod store;
mod types;

pub use chain::{Chain, InsertOutcome};
pub use error::{ChainError, ChainResult};
pub use params::{Network, PROTOCOL_VERSION};
pub use store::{SledTipStore, TipStore};
pub use types::{dsha256, BlockHeader, Hash, HEADER_WIRE_SIZE};

/// Age in seconds below which the chain tip counts as caught up.
pub const TIP_RECENT_SECS: u64 = 24 * 60 * 60;
