//! Error types for quorumkv-raft.

use thiserror::Error;

use quorumkv_proto::ShardId;

use crate::types::ReplicaId;

/// Errors that can occur while hosting shards.
#[derive(Debug, Error)]
pub enum Error {
    /// Error during raft or host initialization.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Error from a sled tree owned by this crate.
    #[error("storage error: {0}")]
    Storage(String),

    /// Error from the replicated key/value engine.
    #[error(transparent)]
    Store(#[from] quorumkv_store::Error),

    /// Malformed envelope or out-of-range shard id.
    #[error(transparent)]
    Protocol(#[from] quorumkv_proto::Error),

    /// Filesystem error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Error during transport operations.
    #[error("network error: {0}")]
    Network(String),

    /// Error during serialization/deserialization.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No replica of the shard is running on this host.
    #[error("shard {0} not found on this host")]
    ShardNotFound(ShardId),

    /// A replica of the shard is already running on this host.
    #[error("shard {0} already has a replica on this host")]
    ShardAlreadyExist(ShardId),

    /// The replica must be stopped first.
    #[error("replica {replica_id} of shard {shard_id} is still running")]
    ReplicaRunning { shard_id: ShardId, replica_id: ReplicaId },

    /// A fresh replica was requested but local data already exists.
    #[error("replica {replica_id} of shard {shard_id} already has local data")]
    ReplicaDataExists { shard_id: ShardId, replica_id: ReplicaId },

    /// The membership read back carried no config-change id.
    #[error("no config change id available for shard {0}")]
    NoConfigChangeId(ShardId),

    /// The local replica is not the leader.
    #[error("not the leader of shard {shard_id}, current leader is {leader:?}")]
    NotLeader { shard_id: ShardId, leader: Option<ReplicaId> },

    /// The operation did not finish before its deadline.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// The operation was refused, e.g. a stale config-change id.
    #[error("operation rejected: {0}")]
    Rejected(String),

    /// The operation was dropped before it could be proposed.
    #[error("operation dropped: {0}")]
    Dropped(String),

    /// The operation was aborted by the consensus core.
    #[error("operation aborted: {0}")]
    Aborted(String),

    /// The replica or host stopped while the operation was in flight.
    #[error("operation terminated: {0}")]
    Terminated(String),

    /// The session is not registered in the replicated registry.
    #[error("session {client_id} expired")]
    SessionExpired { client_id: u64 },

    /// The transaction manager has no cached session for the client id.
    #[error("no session cached for client {0}")]
    SessionNotFound(u64),

    /// Nil, no-op or sentinel transaction passed to commit or close.
    #[error("unsupported transaction: {0}")]
    UnsupportedTransaction(String),

    /// The state machine does not support the requested operation.
    #[error("unsupported method: {0}")]
    UnsupportedMethod(String),

    /// The key/value engine answered with an error reply.
    #[error("kv error {code}: {message}")]
    Kv { code: u32, message: String },

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// The error code carried by an engine error reply, if any.
    pub fn kv_code(&self) -> Option<u32> {
        match self {
            Error::Kv { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<sled::Error> for Error {
    fn from(err: sled::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

/// Outcome of an operation that may complete in several non-error ways.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationResult {
    Completed,
    Timeout,
    Rejected,
    Dropped,
    Aborted,
    Terminated,
}

impl OperationResult {
    pub fn is_completed(&self) -> bool {
        matches!(self, OperationResult::Completed)
    }
}

impl From<&Error> for OperationResult {
    fn from(err: &Error) -> Self {
        match err {
            Error::Timeout(_) => OperationResult::Timeout,
            Error::Rejected(_) => OperationResult::Rejected,
            Error::Dropped(_) | Error::NotLeader { .. } => OperationResult::Dropped,
            Error::Terminated(_) => OperationResult::Terminated,
            _ => OperationResult::Aborted,
        }
    }
}

/// Result alias for this crate.
pub type Result<T> = std::result::Result<T, Error>;
