//! Storage engine error types.

use quorumkv_proto::error_codes;
use thiserror::Error;

/// Storage engine errors.
#[derive(Debug, Error)]
pub enum Error {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Storage(#[from] sled::Error),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] quorumkv_proto::Error),

    /// Account id is zero.
    #[error("invalid account id")]
    InvalidAccount,

    /// Owner is empty.
    #[error("invalid owner")]
    InvalidOwner,

    /// Bucket name is empty or too long.
    #[error("invalid bucket name: {0}")]
    InvalidBucketName(String),

    /// Account does not exist.
    #[error("account {0} does not exist")]
    MissingAccountBucket(u64),

    /// Bucket does not exist.
    #[error("bucket {bucket} does not exist in account {account_id}")]
    MissingBucket { account_id: u64, bucket: String },

    /// Bucket already exists.
    #[error("bucket {bucket} already exists in account {account_id}")]
    BucketExists { account_id: u64, bucket: String },

    /// Key does not exist.
    #[error("key not found")]
    KeyNotFound,

    /// Compare-and-swap version mismatch.
    #[error("version conflict: stored version {current}, proposed {proposed}")]
    VersionConflict { current: u64, proposed: u64 },

    /// Request kind not allowed on this path.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// Invalid data format.
    #[error("invalid data: {0}")]
    InvalidData(String),
}

impl Error {
    /// Reply envelope error code for this error.
    pub fn code(&self) -> u32 {
        match self {
            Error::Storage(_) | Error::InvalidData(_) => error_codes::INTERNAL,
            Error::Protocol(_) => error_codes::INVALID_REQUEST,
            Error::InvalidAccount => error_codes::INVALID_ACCOUNT,
            Error::InvalidOwner => error_codes::INVALID_OWNER,
            Error::InvalidBucketName(_) => error_codes::INVALID_REQUEST,
            Error::MissingAccountBucket(_) => error_codes::MISSING_ACCOUNT,
            Error::MissingBucket { .. } => error_codes::MISSING_BUCKET,
            Error::BucketExists { .. } => error_codes::BUCKET_EXISTS,
            Error::KeyNotFound => error_codes::KEY_NOT_FOUND,
            Error::VersionConflict { .. } => error_codes::VERSION_CONFLICT,
            Error::UnsupportedMethod(_) => error_codes::UNSUPPORTED_METHOD,
        }
    }

    /// Whether the error is a property of the request rather than of the
    /// storage layer. Such errors are deterministic across replicas.
    pub fn is_request_error(&self) -> bool {
        !matches!(self, Error::Storage(_) | Error::InvalidData(_))
    }
}
