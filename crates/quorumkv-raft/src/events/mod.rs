//! Raft system events.
//!
//! The host reports what happens to its groups through a
//! [`RaftEventListener`]. In a full node that listener is a
//! [`RaftEventPublisher`], which puts every event on the broker under
//! `system.events.<category>`; the [`EventBus`] subscribes to those subjects
//! and fans events out to registered callbacks.

mod broker;
mod bus;
mod lifecycle;
mod publisher;

use serde::{Deserialize, Serialize};

use crate::types::{ReplicaId, ShardId};

pub use broker::{Broker, LocalBroker, Message, Subscription};
pub use bus::{Callback, EventBus};
pub use lifecycle::LifecycleManager;
pub use publisher::RaftEventPublisher;

/// Subject namespace shared by every system event.
pub const SUBJECT_PREFIX: &str = "system.events";

/// Pattern matching every system event subject.
pub const ALL_EVENTS: &str = "system.events.>";

/// Discriminant of [`RaftEvent`], the key of the callback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    NodeReady,
    NodeUnloaded,
    MembershipChanged,
    LeaderUpdated,
    SnapshotStarted,
    SnapshotCompleted,
    SnapshotAborted,
    SnapshotReceived,
    SnapshotRecovered,
    SnapshotCreated,
    SnapshotCompacted,
    LogCompacted,
    LogDbCompacted,
    ConnectionEstablished,
    ConnectionFailed,
    HostShuttingDown,
}

impl EventKind {
    /// Subject category the kind is published under.
    pub fn category(&self) -> &'static str {
        match self {
            EventKind::HostShuttingDown => "host",
            EventKind::LogCompacted | EventKind::LogDbCompacted => "log",
            EventKind::NodeReady | EventKind::NodeUnloaded | EventKind::MembershipChanged => "node",
            EventKind::SnapshotStarted
            | EventKind::SnapshotCompleted
            | EventKind::SnapshotAborted
            | EventKind::SnapshotReceived
            | EventKind::SnapshotRecovered
            | EventKind::SnapshotCreated
            | EventKind::SnapshotCompacted => "snapshot",
            EventKind::ConnectionEstablished | EventKind::ConnectionFailed => "connection",
            EventKind::LeaderUpdated => "raft",
        }
    }
}

/// Something that happened to a hosted group, the host, or the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RaftEvent {
    NodeReady {
        shard_id: ShardId,
        replica_id: ReplicaId,
    },
    NodeUnloaded {
        shard_id: ShardId,
        replica_id: ReplicaId,
    },
    MembershipChanged {
        shard_id: ShardId,
        replica_id: ReplicaId,
        config_change_id: u64,
    },
    LeaderUpdated {
        shard_id: ShardId,
        replica_id: ReplicaId,
        term: u64,
        leader_id: Option<ReplicaId>,
    },
    SnapshotStarted {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    /// A snapshot was streamed to a peer.
    SnapshotCompleted {
        shard_id: ShardId,
        replica_id: ReplicaId,
        to: ReplicaId,
        index: u64,
    },
    SnapshotAborted {
        shard_id: ShardId,
        replica_id: ReplicaId,
        to: ReplicaId,
        index: u64,
    },
    /// A snapshot streamed from the leader is about to be installed.
    SnapshotReceived {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    SnapshotRecovered {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    SnapshotCreated {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    /// An older snapshot was replaced and deleted.
    SnapshotCompacted {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    LogCompacted {
        shard_id: ShardId,
        replica_id: ReplicaId,
        index: u64,
    },
    LogDbCompacted {
        shard_id: ShardId,
        replica_id: ReplicaId,
    },
    ConnectionEstablished {
        address: String,
    },
    ConnectionFailed {
        address: String,
    },
    HostShuttingDown,
}

impl RaftEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RaftEvent::NodeReady { .. } => EventKind::NodeReady,
            RaftEvent::NodeUnloaded { .. } => EventKind::NodeUnloaded,
            RaftEvent::MembershipChanged { .. } => EventKind::MembershipChanged,
            RaftEvent::LeaderUpdated { .. } => EventKind::LeaderUpdated,
            RaftEvent::SnapshotStarted { .. } => EventKind::SnapshotStarted,
            RaftEvent::SnapshotCompleted { .. } => EventKind::SnapshotCompleted,
            RaftEvent::SnapshotAborted { .. } => EventKind::SnapshotAborted,
            RaftEvent::SnapshotReceived { .. } => EventKind::SnapshotReceived,
            RaftEvent::SnapshotRecovered { .. } => EventKind::SnapshotRecovered,
            RaftEvent::SnapshotCreated { .. } => EventKind::SnapshotCreated,
            RaftEvent::SnapshotCompacted { .. } => EventKind::SnapshotCompacted,
            RaftEvent::LogCompacted { .. } => EventKind::LogCompacted,
            RaftEvent::LogDbCompacted { .. } => EventKind::LogDbCompacted,
            RaftEvent::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            RaftEvent::ConnectionFailed { .. } => EventKind::ConnectionFailed,
            RaftEvent::HostShuttingDown => EventKind::HostShuttingDown,
        }
    }

    /// Shard the event is about, if any.
    pub fn shard_id(&self) -> Option<ShardId> {
        match self {
            RaftEvent::NodeReady { shard_id, .. }
            | RaftEvent::NodeUnloaded { shard_id, .. }
            | RaftEvent::MembershipChanged { shard_id, .. }
            | RaftEvent::LeaderUpdated { shard_id, .. }
            | RaftEvent::SnapshotStarted { shard_id, .. }
            | RaftEvent::SnapshotCompleted { shard_id, .. }
            | RaftEvent::SnapshotAborted { shard_id, .. }
            | RaftEvent::SnapshotReceived { shard_id, .. }
            | RaftEvent::SnapshotRecovered { shard_id, .. }
            | RaftEvent::SnapshotCreated { shard_id, .. }
            | RaftEvent::SnapshotCompacted { shard_id, .. }
            | RaftEvent::LogCompacted { shard_id, .. }
            | RaftEvent::LogDbCompacted { shard_id, .. } => Some(*shard_id),
            RaftEvent::ConnectionEstablished { .. }
            | RaftEvent::ConnectionFailed { .. }
            | RaftEvent::HostShuttingDown => None,
        }
    }

    /// Broker subject of the event.
    pub fn subject(&self) -> String {
        format!("{SUBJECT_PREFIX}.{}", self.kind().category())
    }
}

/// Receiver of host events. Implementations must not block.
pub trait RaftEventListener: Send + Sync {
    fn on_event(&self, event: RaftEvent);
}

/// Listener that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopListener;

impl RaftEventListener for NoopListener {
    fn on_event(&self, _event: RaftEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects_by_category() {
        assert_eq!(RaftEvent::HostShuttingDown.subject(), "system.events.host");
        let leader = RaftEvent::LeaderUpdated {
            shard_id: 1,
            replica_id: 1,
            term: 2,
            leader_id: Some(1),
        };
        assert_eq!(leader.subject(), "system.events.raft");
        assert_eq!(leader.shard_id(), Some(1));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let event = RaftEvent::LogDbCompacted {
            shard_id: 5,
            replica_id: 2,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "log_db_compacted");
        let back: RaftEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back, event);
    }
}
