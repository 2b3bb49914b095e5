//! # spv-net
//!
//! P2P networking engine for an SPV header client.
//!
//! This crate provides:
//! - Wire message types and the framing codec
//! - Per-peer connection tasks with handshake and heartbeat
//! - DNS seed discovery
//! - The client: connection pool management and header synchronization

mod client;
mod codec;
mod connection;
pub mod discovery;
mod error;
mod message;
mod peer;

pub use client::{Client, ClientConfig, DEFAULT_MAX_CONNECTIONS, HEADER_TIMEOUT};
pub use codec::{MessageCodec, FRAME_HEADER_SIZE, MAX_PAYLOAD_SIZE};
pub use connection::{Connection, ConnectionConfig, PeerCommand, PeerEvent};
pub use error::{NetworkError, NetworkResult};
pub use message::{
    BlockLocator, Command, Inv, InvType, Message, NetAddr, RejectCode, RejectMessage,
    VersionMessage, VersionNetAddr, COMMAND_SIZE, MAX_ADDR_ENTRIES, MAX_HEADERS_ENTRIES,
    MAX_INV_ENTRIES,
};
pub use peer::{Peer, PeerBook};
