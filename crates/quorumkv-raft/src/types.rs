//! Core type definitions for openraft integration.

use std::fmt;
use std::io::Cursor;

use serde::{Deserialize, Serialize};

pub use quorumkv_proto::{ReplicaId, ShardId};

/// Raft node identifier. One replica of a shard is one raft node.
pub type NodeId = ReplicaId;

/// Type alias for one shard's openraft instance.
pub type ShardRaft = openraft::Raft<TypeConfig>;

/// Type alias for log entry.
pub type LogEntry = openraft::Entry<TypeConfig>;

/// Type alias for log ID.
pub type LogId = openraft::LogId<NodeId>;

/// Type alias for membership.
pub type Membership = openraft::Membership<NodeId, ReplicaNode>;

/// Type alias for stored membership.
pub type StoredMembership = openraft::StoredMembership<NodeId, ReplicaNode>;

/// Type alias for snapshot metadata.
pub type SnapshotMeta = openraft::SnapshotMeta<NodeId, ReplicaNode>;

/// Type alias for raft metrics.
pub type RaftMetrics = openraft::RaftMetrics<NodeId, ReplicaNode>;

openraft::declare_raft_types!(
    /// quorumkv raft type configuration, shared by every shard.
    pub TypeConfig:
        D = Command,
        R = CommandResult,
        NodeId = NodeId,
        Node = ReplicaNode,
        Entry = openraft::Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
);

/// How a member takes part in its shard.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Voting member with a full state machine.
    #[default]
    Replica,
    /// Non-voting member with a full state machine.
    Observer,
    /// Voting member that keeps no payload data.
    Witness,
}

impl ReplicaRole {
    /// Whether the member counts towards quorum.
    pub fn is_voter(&self) -> bool {
        !matches!(self, ReplicaRole::Observer)
    }
}

impl fmt::Display for ReplicaRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReplicaRole::Replica => write!(f, "replica"),
            ReplicaRole::Observer => write!(f, "observer"),
            ReplicaRole::Witness => write!(f, "witness"),
        }
    }
}

/// Membership metadata of one member: where it lives and what it is.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaNode {
    pub addr: String,
    pub role: ReplicaRole,
}

impl ReplicaNode {
    pub fn new(addr: impl Into<String>, role: ReplicaRole) -> Self {
        Self {
            addr: addr.into(),
            role,
        }
    }

    pub fn replica(addr: impl Into<String>) -> Self {
        Self::new(addr, ReplicaRole::Replica)
    }

    pub fn observer(addr: impl Into<String>) -> Self {
        Self::new(addr, ReplicaRole::Observer)
    }

    pub fn witness(addr: impl Into<String>) -> Self {
        Self::new(addr, ReplicaRole::Witness)
    }
}

impl fmt::Display for ReplicaNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.role, self.addr)
    }
}

/// Session header attached to every user proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeader {
    pub client_id: u64,
    pub series_id: u64,
    pub responded_to: u64,
}

/// A command replicated through a shard's log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Open a client session in the replicated registry.
    RegisterSession { client_id: u64 },

    /// Close a client session.
    UnregisterSession { client_id: u64 },

    /// Apply an opaque payload to the user state machine.
    Propose { session: SessionHeader, payload: Vec<u8> },
}

/// Outcome of applying one log entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandResult {
    /// Blank and membership entries.
    #[default]
    Empty,

    /// The session is now registered.
    Registered,

    /// The session was removed.
    Unregistered,

    /// The user state machine applied the payload.
    Applied { value: u64, data: Vec<u8> },

    /// The client id is not registered.
    SessionExpired,

    /// The entry was refused without touching the user state machine.
    Rejected(String),
}

impl CommandResult {
    pub fn applied(value: u64, data: Vec<u8>) -> Self {
        CommandResult::Applied { value, data }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_voting() {
        assert!(ReplicaRole::Replica.is_voter());
        assert!(ReplicaRole::Witness.is_voter());
        assert!(!ReplicaRole::Observer.is_voter());
    }

    #[test]
    fn test_node_display() {
        assert_eq!(ReplicaNode::witness("10.0.0.1:9101").to_string(), "witness@10.0.0.1:9101");
    }

    #[test]
    fn test_command_json_is_stable() {
        let cmd = Command::Propose {
            session: SessionHeader {
                client_id: 9,
                series_id: 1,
                responded_to: 0,
            },
            payload: vec![1, 2, 3],
        };
        let bytes = serde_json::to_vec(&cmd).unwrap();
        assert_eq!(serde_json::to_vec(&cmd).unwrap(), bytes);
        let decoded: Command = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(decoded, cmd);
    }
}
