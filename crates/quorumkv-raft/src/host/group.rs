//! One locally running replica and the tasks that watch it.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::config::ReplicaPaths;
use crate::events::{RaftEvent, RaftEventListener};
use crate::shard::membership::{config_change_id, MembershipEntry};
use crate::statemachine::{SharedStateMachine, StateMachineType};
use crate::types::{LogId, RaftMetrics, ReplicaId, ReplicaRole, ShardId, ShardRaft};

/// How long to wait for openraft's workers to release the state machine
/// after shutdown before closing it.
const RELEASE_WAIT: Duration = Duration::from_secs(5);

pub(crate) struct ShardGroup {
    pub shard_id: ShardId,
    pub replica_id: ReplicaId,
    pub role: ReplicaRole,
    pub sm_type: StateMachineType,
    pub raft: ShardRaft,
    pub user: SharedStateMachine,
    pub removed: Arc<RwLock<BTreeSet<ReplicaId>>>,
    /// Serializes fenced membership changes of this shard.
    pub membership_lock: Mutex<()>,
    pub paths: ReplicaPaths,
    watcher: JoinHandle<()>,
}

impl ShardGroup {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        shard_id: ShardId,
        replica_id: ReplicaId,
        role: ReplicaRole,
        sm_type: StateMachineType,
        raft: ShardRaft,
        user: SharedStateMachine,
        removed: Arc<RwLock<BTreeSet<ReplicaId>>>,
        paths: ReplicaPaths,
        listener: Arc<dyn RaftEventListener>,
    ) -> Self {
        let watcher = tokio::spawn(watch_metrics(shard_id, replica_id, raft.metrics(), listener));
        Self {
            shard_id,
            replica_id,
            role,
            sm_type,
            raft,
            user,
            removed,
            membership_lock: Mutex::new(()),
            paths,
            watcher,
        }
    }

    pub fn metrics(&self) -> RaftMetrics {
        self.raft.metrics().borrow().clone()
    }

    pub fn membership(&self) -> MembershipEntry {
        let metrics = self.metrics();
        MembershipEntry::from_stored(self.shard_id, &metrics.membership_config, self.removed.read().clone())
    }

    pub fn leader_id(&self) -> Option<ReplicaId> {
        self.raft.metrics().borrow().current_leader
    }

    /// Stop raft and close the user state machine once openraft no longer
    /// holds it.
    pub async fn shutdown(&self) -> crate::error::Result<()> {
        let result = self.raft.shutdown().await;
        self.watcher.abort();
        if let Err(e) = result {
            return Err(crate::error::Error::Terminated(format!(
                "raft of shard {} did not stop cleanly: {e}",
                self.shard_id
            )));
        }

        let deadline = tokio::time::Instant::now() + RELEASE_WAIT;
        while Arc::strong_count(&self.user) > 1 {
            if tokio::time::Instant::now() >= deadline {
                tracing::warn!(
                    shard_id = self.shard_id,
                    replica_id = self.replica_id,
                    "state machine still referenced after shutdown, syncing instead of closing"
                );
                return self.user.read().sync();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.user.write().close()
    }
}

/// Turn metric changes of one raft instance into events.
async fn watch_metrics(
    shard_id: ShardId,
    replica_id: ReplicaId,
    mut metrics: watch::Receiver<RaftMetrics>,
    listener: Arc<dyn RaftEventListener>,
) {
    let mut ready = false;
    let mut leader: Option<ReplicaId> = None;
    let mut ccid: Option<u64> = None;
    let mut purged: Option<LogId> = None;

    loop {
        let m = metrics.borrow_and_update().clone();

        if !ready && m.running_state.is_ok() {
            ready = true;
            listener.on_event(RaftEvent::NodeReady { shard_id, replica_id });
        }

        if m.current_leader != leader {
            leader = m.current_leader;
            tracing::info!(shard_id, replica_id, term = m.current_term, leader = ?leader, "leader updated");
            listener.on_event(RaftEvent::LeaderUpdated {
                shard_id,
                replica_id,
                term: m.current_term,
                leader_id: leader,
            });
        }

        let current = config_change_id(&m.membership_config);
        if current != 0 && ccid != Some(current) {
            ccid = Some(current);
            listener.on_event(RaftEvent::MembershipChanged {
                shard_id,
                replica_id,
                config_change_id: current,
            });
        }

        if m.purged != purged {
            purged = m.purged;
            if let Some(log_id) = purged {
                listener.on_event(RaftEvent::LogCompacted {
                    shard_id,
                    replica_id,
                    index: log_id.index,
                });
            }
        }

        if metrics.changed().await.is_err() {
            break;
        }
    }
}
