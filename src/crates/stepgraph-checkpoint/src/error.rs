//! Error types for channel and checkpoint operations

use thiserror::Error;

/// Result type for checkpoint operations
pub type Result<T> = std::result::Result<T, CheckpointError>;

/// Errors that can occur during channel and checkpoint operations
#[derive(Error, Debug)]
pub enum CheckpointError {
    /// Read of a channel that has never been written.
    ///
    /// Recoverable: the scheduler treats this as "not yet ready", never
    /// as a failure.
    #[error("channel '{0}' is empty")]
    EmptyChannel(String),

    /// A write violated the target channel's merge contract
    #[error("invalid channel update: {0}")]
    InvalidUpdate(String),

    /// Checkpoint not found
    #[error("checkpoint not found: {0}")]
    NotFound(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Binary serialization error
    #[error("binary serialization error: {0}")]
    BinarySerialization(#[from] bincode::Error),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Custom error
    #[error("{0}")]
    Custom(String),
}

impl CheckpointError {
    /// Whether this error is the recoverable read-before-write condition.
    pub fn is_empty_channel(&self) -> bool {
        matches!(self, CheckpointError::EmptyChannel(_))
    }
}
