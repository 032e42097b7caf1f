//! Multi-shard raft host.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use openraft::error::{
    CheckIsLeaderError, ClientWriteError, Fatal, ForwardToLeader, InitializeError, RaftError,
};
use openraft::{ChangeMembers, Raft};
use parking_lot::RwLock;
use tokio::sync::Mutex;

use super::group::ShardGroup;
use crate::config::HostConfig;
use crate::error::{Error, OperationResult, Result};
use crate::events::{RaftEvent, RaftEventListener};
use crate::network::{ConnectionTracker, NngNetworkFactory, RaftServer, Router, ServerHandle};
use crate::shard::membership::{config_change_id, MembershipEntry};
use crate::statemachine::{self, SmResult, StateMachineType};
use crate::storage::{ReplicaStateMachine, SledLogStore, SnapshotStore};
use crate::types::{
    Command, CommandResult, NodeId, ReplicaId, ReplicaNode, ReplicaRole, SessionHeader, ShardId,
};

/// How a replica comes up in [`NodeHost::start_replica`].
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    /// Initial members of a brand-new shard. Only applied on a fresh start.
    pub bootstrap: Option<BTreeMap<ReplicaId, ReplicaNode>>,
    /// Whether local data from an earlier run is expected and reused.
    pub restart: bool,
}

impl StartOptions {
    /// First member of a new shard, bootstrapping the given membership.
    pub fn bootstrap(members: BTreeMap<ReplicaId, ReplicaNode>) -> Self {
        Self {
            bootstrap: Some(members),
            restart: false,
        }
    }

    /// A fresh member that waits to be added by the shard's leader.
    pub fn join() -> Self {
        Self::default()
    }

    /// Resume a replica from the data of an earlier run.
    pub fn restart() -> Self {
        Self {
            bootstrap: None,
            restart: true,
        }
    }
}

/// What a host knows about its own replica of a shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalReplica {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub role: ReplicaRole,
    pub state_machine: StateMachineType,
}

fn fatal_error(shard_id: ShardId, fatal: Fatal<NodeId>) -> Error {
    match fatal {
        Fatal::Stopped => Error::Terminated(format!("raft of shard {shard_id} is stopped")),
        other => Error::Aborted(format!("raft of shard {shard_id} failed: {other}")),
    }
}

fn forward_error(shard_id: ShardId, forward: ForwardToLeader<NodeId, ReplicaNode>) -> Error {
    Error::NotLeader {
        shard_id,
        leader: forward.leader_id,
    }
}

fn write_error(shard_id: ShardId, err: RaftError<NodeId, ClientWriteError<NodeId, ReplicaNode>>) -> Error {
    match err {
        RaftError::APIError(ClientWriteError::ForwardToLeader(forward)) => forward_error(shard_id, forward),
        RaftError::APIError(ClientWriteError::ChangeMembershipError(e)) => Error::Rejected(e.to_string()),
        RaftError::Fatal(fatal) => fatal_error(shard_id, fatal),
    }
}

fn leader_error(shard_id: ShardId, err: RaftError<NodeId, CheckIsLeaderError<NodeId, ReplicaNode>>) -> Error {
    match err {
        RaftError::APIError(CheckIsLeaderError::ForwardToLeader(forward)) => forward_error(shard_id, forward),
        RaftError::APIError(CheckIsLeaderError::QuorumNotEnough(e)) => Error::Dropped(e.to_string()),
        RaftError::Fatal(fatal) => fatal_error(shard_id, fatal),
    }
}

/// Run `fut` under a caller deadline.
async fn deadline<T>(timeout: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(format!("{what} did not finish within {timeout:?}"))),
    }
}

/// Hosts replicas of any number of shards behind one raft transport.
///
/// Every replica gets its own openraft instance, log database, state
/// machine and snapshot directory under the host's data directory. The
/// transport server routes each incoming RPC to the instance of the shard
/// it names.
pub struct NodeHost {
    config: HostConfig,
    groups: DashMap<ShardId, Arc<ShardGroup>>,
    router: Router,
    connections: Arc<ConnectionTracker>,
    listener: Arc<dyn RaftEventListener>,
    server: Mutex<Option<ServerHandle>>,
    /// Serializes starts and stops so a shard is never half registered.
    lifecycle: Mutex<()>,
}

impl NodeHost {
    /// Validate the configuration and start the raft transport.
    pub async fn new(config: HostConfig, listener: Arc<dyn RaftEventListener>) -> Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.data_dir)
            .map_err(|e| Error::Initialization(format!("failed to create {}: {e}", config.data_dir.display())))?;

        let router: Router = Arc::new(DashMap::new());
        let server = RaftServer::new(config.raft_listen_addr.clone(), router.clone())
            .with_workers(config.rpc_workers)
            .start()?;

        tracing::info!(
            listen = %config.raft_listen_addr,
            advertise = %config.raft_advertise_addr,
            data_dir = %config.data_dir.display(),
            "node host started"
        );

        Ok(Self {
            connections: Arc::new(ConnectionTracker::new(listener.clone())),
            config,
            groups: DashMap::new(),
            router,
            listener,
            server: Mutex::new(Some(server)),
            lifecycle: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Address other hosts reach this host at.
    pub fn raft_address(&self) -> &str {
        &self.config.raft_advertise_addr
    }

    fn group(&self, shard_id: ShardId) -> Result<Arc<ShardGroup>> {
        self.groups
            .get(&shard_id)
            .map(|g| g.value().clone())
            .ok_or(Error::ShardNotFound(shard_id))
    }

    /// Start a local replica of a shard.
    ///
    /// A fresh start refuses to reuse data left by an earlier run; a
    /// restart reuses it and never bootstraps.
    pub async fn start_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        role: ReplicaRole,
        sm_type: StateMachineType,
        options: StartOptions,
    ) -> Result<()> {
        let _guard = self.lifecycle.lock().await;
        if self.groups.contains_key(&shard_id) {
            return Err(Error::ShardAlreadyExist(shard_id));
        }

        let paths = self.config.replica_paths(shard_id, replica_id);
        if !options.restart && paths.exists() {
            return Err(Error::ReplicaDataExists { shard_id, replica_id });
        }
        std::fs::create_dir_all(&paths.root)?;

        let db = sled::open(&paths.raft_log)?;
        let log_store = SledLogStore::open(shard_id, replica_id, db.clone(), self.listener.clone())?;
        let user = Arc::new(RwLock::new(statemachine::create(
            sm_type,
            role,
            shard_id,
            replica_id,
            paths.kv.clone(),
            self.config.store_cache_capacity,
        )));
        let state_machine = ReplicaStateMachine::open(
            shard_id,
            replica_id,
            user.clone(),
            &db,
            SnapshotStore::new(&paths.snapshots),
            self.listener.clone(),
        )?;
        let removed = state_machine.removed_handle();

        let network = NngNetworkFactory::new(shard_id, replica_id, self.connections.clone(), self.listener.clone())
            .with_timeout(self.config.rpc_timeout());
        let raft_config = Arc::new(self.config.raft_config(shard_id)?);
        let raft = Raft::new(replica_id, raft_config, network, log_store, state_machine)
            .await
            .map_err(|e| Error::Initialization(format!("failed to start raft of shard {shard_id}: {e}")))?;

        if let (false, Some(members)) = (options.restart, options.bootstrap) {
            match raft.initialize(members).await {
                Ok(()) => tracing::info!(shard_id, replica_id, "bootstrapped shard"),
                Err(RaftError::APIError(InitializeError::NotAllowed(e))) => {
                    tracing::info!(shard_id, replica_id, reason = %e, "shard already initialized");
                }
                Err(e) => {
                    let _ = raft.shutdown().await;
                    return Err(Error::Initialization(format!("failed to bootstrap shard {shard_id}: {e}")));
                }
            }
        }

        self.router.insert(shard_id, raft.clone());
        let group = ShardGroup::new(
            shard_id,
            replica_id,
            role,
            sm_type,
            raft,
            user,
            removed,
            paths,
            self.listener.clone(),
        );
        self.groups.insert(shard_id, Arc::new(group));

        tracing::info!(shard_id, replica_id, %role, ?sm_type, restart = options.restart, "replica started");
        Ok(())
    }

    /// Stop the local replica without changing the shard's membership.
    pub async fn stop_replica(&self, shard_id: ShardId, replica_id: ReplicaId) -> OperationResult {
        let _guard = self.lifecycle.lock().await;
        let Some(group) = self.groups.get(&shard_id).map(|g| g.value().clone()) else {
            tracing::warn!(shard_id, replica_id, "stop requested for a shard not running here");
            return OperationResult::Rejected;
        };
        if group.replica_id != replica_id {
            tracing::warn!(
                shard_id,
                replica_id,
                running = group.replica_id,
                "stop requested for a replica not running here"
            );
            return OperationResult::Rejected;
        }

        self.router.remove(&shard_id);
        self.groups.remove(&shard_id);
        let result = group.shutdown().await;
        self.listener.on_event(RaftEvent::NodeUnloaded { shard_id, replica_id });

        match result {
            Ok(()) => {
                tracing::info!(shard_id, replica_id, "replica stopped");
                OperationResult::Completed
            }
            Err(e) => {
                tracing::warn!(shard_id, replica_id, error = %e, "replica stopped uncleanly");
                OperationResult::from(&e)
            }
        }
    }

    pub fn has_replica(&self, shard_id: ShardId, replica_id: ReplicaId) -> bool {
        self.groups
            .get(&shard_id)
            .map(|g| g.replica_id == replica_id)
            .unwrap_or(false)
    }

    pub fn local_replica(&self, shard_id: ShardId) -> Option<LocalReplica> {
        self.groups.get(&shard_id).map(|g| LocalReplica {
            shard_id,
            replica_id: g.replica_id,
            role: g.role,
            state_machine: g.sm_type,
        })
    }

    /// (shard, replica) pairs running on this host.
    pub fn hosted(&self) -> Vec<(ShardId, ReplicaId)> {
        let mut hosted: Vec<_> = self.groups.iter().map(|g| (*g.key(), g.replica_id)).collect();
        hosted.sort_unstable();
        hosted
    }

    /// Delete the on-disk state of a replica that is not running here.
    pub fn remove_data(&self, shard_id: ShardId, replica_id: ReplicaId) -> Result<()> {
        if self.has_replica(shard_id, replica_id) {
            return Err(Error::ReplicaRunning { shard_id, replica_id });
        }
        let paths = self.config.replica_paths(shard_id, replica_id);
        if paths.root.exists() {
            std::fs::remove_dir_all(&paths.root)?;
            tracing::info!(shard_id, replica_id, dir = %paths.root.display(), "removed replica data");
        }
        Ok(())
    }

    async fn write(&self, shard_id: ShardId, command: Command, timeout: Duration) -> Result<CommandResult> {
        let group = self.group(shard_id)?;
        deadline(timeout, "proposal", async {
            group
                .raft
                .client_write(command)
                .await
                .map(|resp| resp.data)
                .map_err(|e| write_error(shard_id, e))
        })
        .await
    }

    /// Propose a payload to the shard's user state machine.
    pub async fn propose(
        &self,
        shard_id: ShardId,
        session: SessionHeader,
        payload: Vec<u8>,
        timeout: Duration,
    ) -> Result<SmResult> {
        match self.write(shard_id, Command::Propose { session, payload }, timeout).await? {
            CommandResult::Applied { value, data } => Ok(SmResult { value, data }),
            CommandResult::SessionExpired => Err(Error::SessionExpired {
                client_id: session.client_id,
            }),
            CommandResult::Rejected(reason) => Err(Error::Rejected(reason)),
            other => Err(Error::Internal(format!("unexpected proposal result {other:?}"))),
        }
    }

    /// Register a client session in the shard's replicated registry.
    pub async fn register_session(&self, shard_id: ShardId, client_id: u64, timeout: Duration) -> Result<()> {
        match self.write(shard_id, Command::RegisterSession { client_id }, timeout).await? {
            CommandResult::Registered => Ok(()),
            other => Err(Error::Internal(format!("unexpected registration result {other:?}"))),
        }
    }

    pub async fn unregister_session(&self, shard_id: ShardId, client_id: u64, timeout: Duration) -> Result<()> {
        match self.write(shard_id, Command::UnregisterSession { client_id }, timeout).await? {
            CommandResult::Unregistered => Ok(()),
            CommandResult::SessionExpired => Err(Error::SessionExpired { client_id }),
            other => Err(Error::Internal(format!("unexpected unregistration result {other:?}"))),
        }
    }

    /// Linearizable read against the shard's user state machine.
    pub async fn read(&self, shard_id: ShardId, query: &[u8], timeout: Duration) -> Result<Vec<u8>> {
        let group = self.group(shard_id)?;
        deadline(timeout, "read index", async {
            group
                .raft
                .ensure_linearizable()
                .await
                .map_err(|e| leader_error(shard_id, e))
        })
        .await?;
        let result = group.user.read().lookup(query);
        result
    }

    /// Membership as last applied locally.
    pub fn membership(&self, shard_id: ShardId) -> Result<MembershipEntry> {
        Ok(self.group(shard_id)?.membership())
    }

    /// Membership once a leader is known, confirmed by a read index when
    /// this host leads.
    pub async fn sync_membership(&self, shard_id: ShardId, timeout: Duration) -> Result<MembershipEntry> {
        let group = self.group(shard_id)?;
        deadline(timeout, "membership query", async {
            let metrics = group
                .raft
                .wait(Some(timeout))
                .metrics(|m| m.current_leader.is_some(), "leader known")
                .await
                .map_err(|e| Error::Timeout(e.to_string()))?;
            if metrics.current_leader == Some(group.replica_id) {
                group
                    .raft
                    .ensure_linearizable()
                    .await
                    .map_err(|e| leader_error(shard_id, e))?;
            }
            Ok(group.membership())
        })
        .await
    }

    /// The shard's leader as known locally.
    pub fn leader_id(&self, shard_id: ShardId) -> Result<Option<ReplicaId>> {
        Ok(self.group(shard_id)?.leader_id())
    }

    /// Refuse a membership change carrying a stale config-change id or a
    /// replica id that already left the shard.
    fn check_fence(group: &ShardGroup, config_change_id: u64, replica_id: ReplicaId) -> Result<()> {
        let current = self::config_change_id(&group.metrics().membership_config);
        if config_change_id != current {
            return Err(Error::Rejected(format!(
                "config change id {config_change_id} is stale for shard {}, current is {current}",
                group.shard_id
            )));
        }
        if group.removed.read().contains(&replica_id) {
            return Err(Error::Rejected(format!(
                "replica {replica_id} was removed from shard {}",
                group.shard_id
            )));
        }
        Ok(())
    }

    fn require_leader(group: &ShardGroup) -> Result<()> {
        let leader = group.leader_id();
        if leader != Some(group.replica_id) {
            return Err(Error::NotLeader {
                shard_id: group.shard_id,
                leader,
            });
        }
        Ok(())
    }

    /// Add a member of any role, fenced by the caller's config-change id.
    ///
    /// Voters join as learners first and are promoted once the learner
    /// entry commits; the promotion completes when the new member has
    /// caught up, so it should already be running.
    pub async fn request_add(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        node: ReplicaNode,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        let group = self.group(shard_id)?;
        let _fence = group.membership_lock.lock().await;
        Self::require_leader(&group)?;
        Self::check_fence(&group, config_change_id, replica_id)?;

        let role = node.role;
        deadline(timeout, "membership change", async {
            group
                .raft
                .add_learner(replica_id, node, false)
                .await
                .map_err(|e| write_error(shard_id, e))?;
            if role.is_voter() {
                group
                    .raft
                    .change_membership(ChangeMembers::AddVoterIds(BTreeSet::from([replica_id])), false)
                    .await
                    .map_err(|e| write_error(shard_id, e))?;
            }
            Ok(())
        })
        .await?;

        tracing::info!(shard_id, replica_id, %role, "member added");
        Ok(())
    }

    pub async fn request_add_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        self.request_add(shard_id, replica_id, ReplicaNode::replica(addr), config_change_id, timeout)
            .await
    }

    pub async fn request_add_observer(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        self.request_add(shard_id, replica_id, ReplicaNode::observer(addr), config_change_id, timeout)
            .await
    }

    pub async fn request_add_witness(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        addr: impl Into<String>,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        self.request_add(shard_id, replica_id, ReplicaNode::witness(addr), config_change_id, timeout)
            .await
    }

    /// Remove a member of any role, fenced by the caller's config-change id.
    pub async fn request_delete_replica(
        &self,
        shard_id: ShardId,
        replica_id: ReplicaId,
        config_change_id: u64,
        timeout: Duration,
    ) -> Result<()> {
        let group = self.group(shard_id)?;
        let _fence = group.membership_lock.lock().await;
        Self::require_leader(&group)?;
        Self::check_fence(&group, config_change_id, replica_id)?;

        let metrics = group.metrics();
        let membership = metrics.membership_config.membership();
        let is_voter = membership.voter_ids().any(|id| id == replica_id);
        let is_member = is_voter || membership.learner_ids().any(|id| id == replica_id);
        if !is_member {
            return Err(Error::Rejected(format!(
                "replica {replica_id} is not a member of shard {shard_id}"
            )));
        }

        let ids = BTreeSet::from([replica_id]);
        let change = if is_voter {
            ChangeMembers::RemoveVoters(ids)
        } else {
            ChangeMembers::RemoveNodes(ids)
        };
        deadline(timeout, "membership change", async {
            group
                .raft
                .change_membership(change, false)
                .await
                .map(|_| ())
                .map_err(|e| write_error(shard_id, e))
        })
        .await?;

        tracing::info!(shard_id, replica_id, "member removed");
        Ok(())
    }

    /// Stop every replica and the transport.
    pub async fn close(&self) {
        self.listener.on_event(RaftEvent::HostShuttingDown);
        for (shard_id, replica_id) in self.hosted() {
            let result = self.stop_replica(shard_id, replica_id).await;
            if !result.is_completed() {
                tracing::warn!(shard_id, replica_id, ?result, "replica did not stop cleanly");
            }
        }
        if let Some(mut server) = self.server.lock().await.take() {
            server.stop().await;
        }
        tracing::info!("node host closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopListener;
    use crate::statemachine::{MemoryOp, MemoryQuery};

    fn free_addr() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr.to_string()
    }

    async fn host(dir: &std::path::Path) -> NodeHost {
        let config = HostConfig::new(dir)
            .with_raft_addr(free_addr())
            .with_heartbeat_interval_ms(50)
            .with_election_timeout_ms(150, 300);
        NodeHost::new(config, Arc::new(NoopListener)).await.unwrap()
    }

    async fn bootstrap(host: &NodeHost, shard_id: ShardId) {
        let members = BTreeMap::from([(1, ReplicaNode::replica(host.raft_address()))]);
        host.start_replica(
            shard_id,
            1,
            ReplicaRole::Replica,
            StateMachineType::InMemory,
            StartOptions::bootstrap(members),
        )
        .await
        .unwrap();
        host.sync_membership(shard_id, Duration::from_secs(5)).await.unwrap();
    }

    fn noop_session() -> SessionHeader {
        SessionHeader {
            client_id: 0,
            series_id: 0,
            responded_to: 0,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_propose_and_read_single_member() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path()).await;
        bootstrap(&host, 10).await;

        let op = MemoryOp::Set {
            key: "a".into(),
            value: b"1".to_vec(),
        };
        let result = host
            .propose(10, noop_session(), op.encode().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.value, 1);

        let value = host
            .read(10, &MemoryQuery::Get { key: "a".into() }.encode().unwrap(), Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(value, b"1".to_vec());
        assert_eq!(host.leader_id(10).unwrap(), Some(1));

        host.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stale_config_change_id_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path()).await;
        bootstrap(&host, 11).await;

        let before = host.membership(11).unwrap();
        assert!(before.config_change_id > 0);

        let err = host
            .request_add_observer(11, 5, "127.0.0.1:1", before.config_change_id + 1, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));
        assert_eq!(host.membership(11).unwrap(), before);

        host.request_add_observer(11, 5, "127.0.0.1:1", before.config_change_id, Duration::from_secs(5))
            .await
            .unwrap();
        let after = host.membership(11).unwrap();
        assert!(after.config_change_id > before.config_change_id);
        assert!(after.observers.contains_key(&5));

        host.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_removed_replica_cannot_rejoin() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path()).await;
        bootstrap(&host, 12).await;

        let ccid = host.membership(12).unwrap().config_change_id;
        host.request_add_observer(12, 6, "127.0.0.1:1", ccid, Duration::from_secs(5))
            .await
            .unwrap();
        let ccid = host.membership(12).unwrap().config_change_id;
        host.request_delete_replica(12, 6, ccid, Duration::from_secs(5))
            .await
            .unwrap();

        let membership = host.sync_membership(12, Duration::from_secs(5)).await.unwrap();
        assert!(!membership.contains(6));
        assert!(membership.removed.contains(&6));

        let err = host
            .request_add_observer(12, 6, "127.0.0.1:1", membership.config_change_id, Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Rejected(_)));

        host.close().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_fresh_start_refuses_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path()).await;
        bootstrap(&host, 13).await;
        assert!(matches!(
            host.remove_data(13, 1),
            Err(Error::ReplicaRunning { shard_id: 13, replica_id: 1 })
        ));
        assert_eq!(host.stop_replica(13, 1).await, OperationResult::Completed);
        assert_eq!(host.stop_replica(13, 1).await, OperationResult::Rejected);

        let err = host
            .start_replica(13, 1, ReplicaRole::Replica, StateMachineType::InMemory, StartOptions::join())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ReplicaDataExists { .. }));

        host.start_replica(13, 1, ReplicaRole::Replica, StateMachineType::InMemory, StartOptions::restart())
            .await
            .unwrap();
        assert!(host.has_replica(13, 1));
        assert!(matches!(
            host.start_replica(13, 1, ReplicaRole::Replica, StateMachineType::InMemory, StartOptions::restart())
                .await,
            Err(Error::ShardAlreadyExist(13))
        ));

        host.close().await;
        assert!(host.hosted().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_shard() {
        let dir = tempfile::tempdir().unwrap();
        let host = host(dir.path()).await;
        assert!(matches!(host.membership(99), Err(Error::ShardNotFound(99))));
        assert!(matches!(
            host.propose(99, noop_session(), Vec::new(), Duration::from_secs(1)).await,
            Err(Error::ShardNotFound(99))
        ));
        host.close().await;
    }
}
