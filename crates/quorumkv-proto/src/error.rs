//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Envelope version mismatch.
    #[error("envelope version mismatch: expected {expected}, got {actual}")]
    VersionMismatch { expected: u32, actual: u32 },

    /// Kind tag and payload disagree, or a field is missing.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Shard id is zero or outside the caller's authorized range.
    #[error("shard {shard_id} is outside the {range} range")]
    ShardOutOfRange { shard_id: u64, range: &'static str },
}
