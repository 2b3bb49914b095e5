//! Network error types.

use thiserror::Error;

/// Network errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// The remote closed the connection.
    #[error("connection closed")]
    ConnectionClosed,

    /// A frame or payload failed to parse.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Frame payload over the size cap.
    #[error("message too large: {size} bytes, max {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// Frame magic did not match the configured network.
    #[error("network magic mismatch: expected {expected:#010x}, got {got:#010x}")]
    MagicMismatch { expected: u32, got: u32 },

    /// Frame checksum did not match the payload.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// The peer broke protocol rules.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Application send attempted before the handshake finished.
    #[error("not connected")]
    NotConnected,

    /// A timer expired.
    #[error("timeout: {0}")]
    Timeout(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for network operations.
pub type NetworkResult<T> = Result<T, NetworkError>;
