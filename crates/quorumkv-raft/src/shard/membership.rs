//! Point-in-time view of a shard's membership.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::types::{ReplicaId, ReplicaRole, ShardId, StoredMembership};

/// Config-change id of a stored membership: one past the index of the log
/// entry that carried it, or 0 if no membership was ever committed.
pub fn config_change_id(membership: &StoredMembership) -> u64 {
    membership.log_id().map(|l| l.index + 1).unwrap_or(0)
}

/// Members of a shard grouped by role, with their host addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipEntry {
    pub shard_id: ShardId,
    /// Fencing token for the next membership change.
    pub config_change_id: u64,
    pub replicas: BTreeMap<ReplicaId, String>,
    pub observers: BTreeMap<ReplicaId, String>,
    pub witnesses: BTreeMap<ReplicaId, String>,
    /// Replicas that left the shard and may never rejoin under the same id.
    pub removed: BTreeSet<ReplicaId>,
}

impl MembershipEntry {
    pub fn from_stored(shard_id: ShardId, stored: &StoredMembership, removed: BTreeSet<ReplicaId>) -> Self {
        let mut entry = Self {
            shard_id,
            config_change_id: config_change_id(stored),
            removed,
            ..Default::default()
        };
        for (id, node) in stored.membership().nodes() {
            let members = match node.role {
                ReplicaRole::Replica => &mut entry.replicas,
                ReplicaRole::Observer => &mut entry.observers,
                ReplicaRole::Witness => &mut entry.witnesses,
            };
            members.insert(*id, node.addr.clone());
        }
        entry
    }

    /// Whether the replica is a current member in any role.
    pub fn contains(&self, replica_id: ReplicaId) -> bool {
        self.replicas.contains_key(&replica_id)
            || self.observers.contains_key(&replica_id)
            || self.witnesses.contains_key(&replica_id)
    }

    /// Role and address of a current member.
    pub fn member(&self, replica_id: ReplicaId) -> Option<(ReplicaRole, &str)> {
        if let Some(addr) = self.replicas.get(&replica_id) {
            return Some((ReplicaRole::Replica, addr));
        }
        if let Some(addr) = self.observers.get(&replica_id) {
            return Some((ReplicaRole::Observer, addr));
        }
        self.witnesses
            .get(&replica_id)
            .map(|addr| (ReplicaRole::Witness, addr.as_str()))
    }

    /// Members of any role hosted at `addr`.
    pub fn hosted_at<'a>(&'a self, addr: &'a str) -> impl Iterator<Item = (ReplicaId, ReplicaRole)> + 'a {
        let pick = move |members: &'a BTreeMap<ReplicaId, String>, role: ReplicaRole| {
            members
                .iter()
                .filter(move |(_, a)| a.as_str() == addr)
                .map(move |(id, _)| (*id, role))
        };
        pick(&self.replicas, ReplicaRole::Replica)
            .chain(pick(&self.observers, ReplicaRole::Observer))
            .chain(pick(&self.witnesses, ReplicaRole::Witness))
    }

    pub fn len(&self) -> usize {
        self.replicas.len() + self.observers.len() + self.witnesses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
