//! Wire messages of the raft transport.
//!
//! One host serves every shard it runs over a single socket, so each
//! request names the shard it is for. openraft's own request and response
//! types travel unchanged, JSON encoded.

use openraft::error::{InstallSnapshotError, RaftError};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, VoteRequest,
    VoteResponse,
};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::types::{NodeId, ShardId, TypeConfig};

/// An RPC addressed to one shard on the receiving host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRequest {
    Vote {
        shard_id: ShardId,
        rpc: VoteRequest<NodeId>,
    },
    AppendEntries {
        shard_id: ShardId,
        rpc: AppendEntriesRequest<TypeConfig>,
    },
    InstallSnapshot {
        shard_id: ShardId,
        rpc: InstallSnapshotRequest<TypeConfig>,
    },
}

impl RaftRequest {
    pub fn shard_id(&self) -> ShardId {
        match self {
            RaftRequest::Vote { shard_id, .. }
            | RaftRequest::AppendEntries { shard_id, .. }
            | RaftRequest::InstallSnapshot { shard_id, .. } => *shard_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RaftRequest::Vote { .. } => "vote",
            RaftRequest::AppendEntries { .. } => "append_entries",
            RaftRequest::InstallSnapshot { .. } => "install_snapshot",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// The answer to a [`RaftRequest`].
#[derive(Debug, Serialize, Deserialize)]
pub enum RaftReply {
    Vote(std::result::Result<VoteResponse<NodeId>, RaftError<NodeId>>),
    AppendEntries(std::result::Result<AppendEntriesResponse<NodeId>, RaftError<NodeId>>),
    InstallSnapshot(std::result::Result<InstallSnapshotResponse<NodeId>, RaftError<NodeId, InstallSnapshotError>>),
    /// The receiving host runs no replica of the shard.
    ShardNotFound(ShardId),
    /// The request could not be decoded.
    Malformed(String),
}

impl RaftReply {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Error for a reply that does not answer the request that was sent.
    pub fn unexpected(&self, expected: &str) -> Error {
        match self {
            RaftReply::ShardNotFound(shard_id) => Error::ShardNotFound(*shard_id),
            RaftReply::Malformed(reason) => Error::Network(format!("peer could not decode {expected}: {reason}")),
            _ => Error::Network(format!("unexpected reply to {expected}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, LogId, Vote};

    use super::*;

    #[test]
    fn test_request_names_its_shard() {
        let request = RaftRequest::Vote {
            shard_id: 1_234,
            rpc: VoteRequest::new(Vote::new(2, 1), Some(LogId::new(CommittedLeaderId::new(1, 1), 5))),
        };
        let decoded = RaftRequest::decode(&request.encode().unwrap()).unwrap();
        assert_eq!(decoded.shard_id(), 1_234);
        assert_eq!(decoded.name(), "vote");
    }

    #[test]
    fn test_unexpected_reply_maps_shard_not_found() {
        let reply = RaftReply::ShardNotFound(9);
        assert!(matches!(reply.unexpected("vote"), Error::ShardNotFound(9)));
    }
}
