//! Shard lifecycle and membership management on top of a [`NodeHost`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use super::membership::MembershipEntry;
use super::store::{ShardState, ShardStore};
use crate::error::{Error, OperationResult, Result};
use crate::host::{NodeHost, StartOptions};
use crate::statemachine::StateMachineType;
use crate::types::{ReplicaId, ReplicaNode, ReplicaRole, ShardId};

/// Default deadline for membership queries issued on behalf of callers
/// that did not supply one.
const MEMBERSHIP_QUERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Creates, starts, stops and reshapes the shards hosted by this process,
/// keeping the local shard-state records in step.
///
/// Membership changes are fenced: each call fetches the current
/// config-change id and hands it to the host, which refuses the change if
/// another change committed in between. Callers see that as
/// [`Error::Rejected`] and may re-fetch and retry; nothing here retries.
pub struct ShardManager {
    host: Arc<NodeHost>,
    store: Arc<ShardStore>,
}

impl ShardManager {
    pub fn new(host: Arc<NodeHost>, store: Arc<ShardStore>) -> Self {
        Self { host, store }
    }

    pub fn host(&self) -> &Arc<NodeHost> {
        &self.host
    }

    pub fn store(&self) -> &Arc<ShardStore> {
        &self.store
    }

    /// Start a brand-new shard with this host's replica as its only voter.
    pub async fn new_shard(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        timeout: Duration,
    ) -> Result<MembershipEntry> {
        let members = BTreeMap::from([(replica_id, ReplicaNode::replica(self.host.raft_address()))]);
        self.host
            .start_replica(
                shard_id,
                replica_id,
                ReplicaRole::Replica,
                sm_type,
                StartOptions::bootstrap(members),
            )
            .await?;

        let membership = self.host.sync_membership(shard_id, timeout).await?;
        self.save_state(&membership);
        tracing::info!(shard_id, replica_id, ?sm_type, "created shard");
        Ok(membership)
    }

    async fn start_member(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        role: ReplicaRole,
        sm_type: StateMachineType,
        restart: bool,
    ) -> Result<()> {
        let options = if restart {
            StartOptions::restart()
        } else {
            StartOptions::join()
        };
        self.host
            .start_replica(shard_id, replica_id, role, sm_type, options)
            .await?;
        self.refresh_local(shard_id);
        Ok(())
    }

    /// Start a voting replica of an existing shard. `restart` resumes from
    /// local data; otherwise the replica joins empty and waits for the
    /// leader to add it.
    pub async fn start_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        restart: bool,
    ) -> Result<()> {
        self.start_member(shard_id, replica_id, ReplicaRole::Replica, sm_type, restart)
            .await
    }

    pub async fn start_replica_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        sm_type: StateMachineType,
        restart: bool,
    ) -> Result<()> {
        self.start_member(shard_id, replica_id, ReplicaRole::Observer, sm_type, restart)
            .await
    }

    pub async fn start_replica_witness(&self, shard_id: ShardId, replica_id: ReplicaId, restart: bool) -> Result<()> {
        // Witnesses never hold payload data, whatever the shard's type.
        self.start_member(
            shard_id,
            replica_id,
            ReplicaRole::Witness,
            StateMachineType::default(),
            restart,
        )
        .await
    }

    /// Current config-change id, failing if none is known yet.
    async fn fence(&self, shard_id: ShardId, timeout: Duration) -> Result<u64> {
        let membership = self.host.sync_membership(shard_id, timeout).await?;
        if membership.config_change_id == 0 {
            return Err(Error::NoConfigChangeId(shard_id));
        }
        Ok(membership.config_change_id)
    }

    async fn add_member(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        node: ReplicaNode,
        timeout: Duration,
    ) -> Result<()> {
        let ccid = self.fence(shard_id, timeout).await?;
        self.host.request_add(shard_id, replica_id, node, ccid, timeout).await?;
        self.refresh_shard_state(shard_id).await;
        Ok(())
    }

    /// Add a voting replica hosted at `addr`.
    ///
    /// The new replica should already be running (started with
    /// `restart = false`), since the change commits only once it has
    /// caught up.
    pub async fn add_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<()> {
        self.add_member(shard_id, replica_id, ReplicaNode::replica(addr), timeout)
            .await
    }

    pub async fn add_replica_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<()> {
        self.add_member(shard_id, replica_id, ReplicaNode::observer(addr), timeout)
            .await
    }

    pub async fn add_replica_witness(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        timeout: Duration,
    ) -> Result<()> {
        self.add_member(shard_id, replica_id, ReplicaNode::witness(addr), timeout)
            .await
    }

    pub async fn remove_replica(&self, shard_id: ShardId, replica_id: ReplicaId, timeout: Duration) -> Result<()> {
        let ccid = self.fence(shard_id, timeout).await?;
        self.host
            .request_delete_replica(shard_id, replica_id, ccid, timeout)
            .await?;
        self.refresh_shard_state(shard_id).await;
        Ok(())
    }

    /// Purge the local data of a replica that has already left its shard.
    ///
    /// Only call this after the removal committed; a replica whose data is
    /// gone while it is still a member can bring back a stale log.
    pub fn remove_data(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<()> {
        self.host.remove_data(shard_id, replica_id)?;
        if let Some(state) = self.store.get(shard_id)? {
            if state.replica_id == replica_id {
                self.store.remove(shard_id)?;
            }
        }
        Ok(())
    }

    pub async fn get_shard_members(&self, shard_id: ShardId, timeout: Duration) -> Result<MembershipEntry> {
        self.host.sync_membership(shard_id, timeout).await
    }

    /// Leader replica id and whether a leader is known.
    pub fn get_leader_id(&self, shard_id: ShardId) -> Result<(ReplicaId, bool)> {
        Ok(match self.host.leader_id(shard_id)? {
            Some(leader) => (leader, true),
            None => (0, false),
        })
    }

    /// Stop the local replica; it stays a member and can be restarted.
    pub async fn stop_replica(&self, shard_id: ShardId, replica_id: ReplicaId) -> OperationResult {
        self.host.stop_replica(shard_id, replica_id).await
    }

    /// Stop every local replica.
    pub async fn stop_all(&self) {
        for (shard_id, replica_id) in self.host.hosted() {
            let result = self.stop_replica(shard_id, replica_id).await;
            if !result.is_completed() {
                tracing::warn!(shard_id, replica_id, ?result, "failed to stop replica");
            }
        }
    }

    /// Every shard recorded in local bookkeeping.
    pub fn shard_states(&self) -> Result<Vec<ShardState>> {
        self.store.list()
    }

    /// Re-read membership and record it. Failures are logged, not returned.
    pub async fn refresh_shard_state(&self, shard_id: ShardId) {
        match self.host.sync_membership(shard_id, MEMBERSHIP_QUERY_TIMEOUT).await {
            Ok(membership) => self.save_state(&membership),
            Err(e) => tracing::warn!(shard_id, error = %e, "failed to refresh shard state"),
        }
    }

    /// Record the locally applied membership without waiting for a leader.
    fn refresh_local(&self, shard_id: ShardId) {
        match self.host.membership(shard_id) {
            Ok(membership) => self.save_state(&membership),
            Err(e) => tracing::warn!(shard_id, error = %e, "failed to refresh shard state"),
        }
    }

    fn save_state(&self, membership: &MembershipEntry) {
        let shard_id = membership.shard_id;
        let Some(local) = self.host.local_replica(shard_id) else {
            tracing::warn!(shard_id, "shard state not saved, no local replica");
            return;
        };
        let state = ShardState::new(local.replica_id, local.role, local.state_machine, membership.clone());
        if let Err(e) = self.store.save(&state) {
            tracing::warn!(shard_id, error = %e, "failed to save shard state");
        }
    }
}
