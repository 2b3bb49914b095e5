//! Chain error types.

use thiserror::Error;

/// Errors from chain state and tip persistence.
#[derive(Error, Debug)]
pub enum ChainError {
    /// A hex string did not parse as a 32-byte hash.
    #[error("invalid hash hex: {0}")]
    InvalidHashHex(String),

    /// The persisted tip blob had the wrong shape.
    #[error("corrupt tip record: {0}")]
    CorruptTip(String),

    /// Storage backend failure.
    #[error("store error: {0}")]
    Store(#[from] sled::Error),

    /// I/O error from the storage layer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for chain operations.
pub type ChainResult<T> = Result<T, ChainError>;
