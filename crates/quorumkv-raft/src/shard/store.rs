//! Local bookkeeping of the shards this host runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use quorumkv_proto::current_millis;

use super::membership::MembershipEntry;
use crate::error::Result;
use crate::statemachine::StateMachineType;
use crate::types::{ReplicaId, ReplicaRole, ShardId};

const SHARDS_TREE: &str = "shards";

/// Last known state of one locally hosted shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardState {
    pub shard_id: ShardId,
    /// The local replica.
    pub replica_id: ReplicaId,
    pub role: ReplicaRole,
    pub state_machine: StateMachineType,
    pub members: MembershipEntry,
    /// Milliseconds since the epoch of the last refresh.
    pub updated: u64,
}

impl ShardState {
    pub fn new(
        replica_id: ReplicaId,
        role: ReplicaRole,
        state_machine: StateMachineType,
        members: MembershipEntry,
    ) -> Self {
        Self {
            shard_id: members.shard_id,
            replica_id,
            role,
            state_machine,
            members,
            updated: current_millis(),
        }
    }
}

/// Sled-backed map from shard id to [`ShardState`], kept in its own
/// database next to the replica directories.
pub struct ShardStore {
    db: Db,
    shards: Tree,
}

impl ShardStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(path.as_ref())?;
        let shards = db.open_tree(SHARDS_TREE)?;
        tracing::debug!(path = %path.as_ref().display(), shards = shards.len(), "opened shard store");
        Ok(Self { db, shards })
    }

    /// In-memory store for tests.
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let shards = db.open_tree(SHARDS_TREE)?;
        Ok(Self { db, shards })
    }

    /// Record `state` unless the stored record carries a newer
    /// config-change id. Returns whether `state` was written.
    ///
    /// Refreshes race each other, so the check and the write are one
    /// compare-and-swap; a lost race retries against the new record.
    pub fn save(&self, state: &ShardState) -> Result<bool> {
        let key = state.shard_id.to_be_bytes();
        let encoded = serde_json::to_vec(state)?;
        loop {
            let current = self.shards.get(key)?;
            if let Some(bytes) = &current {
                let stored: ShardState = serde_json::from_slice(bytes)?;
                if stored.members.config_change_id > state.members.config_change_id {
                    tracing::debug!(
                        shard_id = state.shard_id,
                        stored = stored.members.config_change_id,
                        offered = state.members.config_change_id,
                        "kept newer shard state"
                    );
                    return Ok(false);
                }
            }
            if self
                .shards
                .compare_and_swap(key, current, Some(encoded.clone()))?
                .is_ok()
            {
                break;
            }
        }
        self.shards.flush()?;
        Ok(true)
    }

    pub fn get(&self, shard_id: ShardId) -> Result<Option<ShardState>> {
        match self.shards.get(shard_id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Every recorded shard, ordered by shard id.
    pub fn list(&self) -> Result<Vec<ShardState>> {
        self.shards
            .iter()
            .map(|item| -> Result<ShardState> {
                let (_, bytes) = item?;
                Ok(serde_json::from_slice(&bytes)?)
            })
            .collect()
    }

    pub fn remove(&self, shard_id: ShardId) -> Result<bool> {
        let existed = self.shards.remove(shard_id.to_be_bytes())?.is_some();
        self.shards.flush()?;
        Ok(existed)
    }

    /// Flush everything to disk.
    pub fn close(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
