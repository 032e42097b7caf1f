//! Restart of previously hosted replicas and membership bookkeeping driven
//! by leader changes.

use std::sync::Arc;

use futures::future::BoxFuture;

use super::{Callback, EventBus, EventKind, RaftEvent};
use crate::error::Result;
use crate::shard::ShardManager;
use crate::types::ReplicaRole;

/// Name of the leader-update callback registered on the bus.
const REFRESH_CALLBACK: &str = "lifecycle.refresh-shard-state";

pub struct LifecycleManager {
    manager: Arc<ShardManager>,
    bus: Arc<EventBus>,
}

impl LifecycleManager {
    pub fn new(manager: Arc<ShardManager>, bus: Arc<EventBus>) -> Self {
        Self { manager, bus }
    }

    /// Register the leader-update callback, then restart every member
    /// recorded at this host's raft address. Returns how many started.
    ///
    /// A member that fails to restart is logged and skipped.
    pub async fn start(&self) -> Result<usize> {
        self.bus
            .register_callback(REFRESH_CALLBACK, EventKind::LeaderUpdated, refresh_callback(self.manager.clone()));

        let addr = self.manager.host().raft_address().to_string();
        let mut started = 0;
        for state in self.manager.shard_states()? {
            let shard_id = state.shard_id;
            for (replica_id, role) in state.members.hosted_at(&addr) {
                let result = match role {
                    ReplicaRole::Replica => {
                        self.manager
                            .start_replica(shard_id, replica_id, state.state_machine, true)
                            .await
                    }
                    ReplicaRole::Observer => {
                        self.manager
                            .start_replica_observer(shard_id, replica_id, state.state_machine, true)
                            .await
                    }
                    ReplicaRole::Witness => self.manager.start_replica_witness(shard_id, replica_id, true).await,
                };
                match result {
                    Ok(()) => {
                        started += 1;
                        tracing::info!(shard_id, replica_id, %role, "restarted hosted member");
                    }
                    Err(e) => tracing::warn!(shard_id, replica_id, %role, error = %e, "failed to restart member"),
                }
            }
        }
        tracing::info!(started, addr = %addr, "lifecycle manager started");
        Ok(started)
    }

    /// Stop every local replica and close shard-state storage.
    pub async fn stop(&self) -> Result<()> {
        self.bus.unregister_callback(REFRESH_CALLBACK, EventKind::LeaderUpdated);
        self.manager.stop_all().await;
        self.manager.store().close()?;
        tracing::info!("lifecycle manager stopped");
        Ok(())
    }
}

fn refresh_callback(manager: Arc<ShardManager>) -> Callback {
    Arc::new(move |event: RaftEvent| -> BoxFuture<'static, ()> {
        let manager = manager.clone();
        Box::pin(async move {
            if let RaftEvent::LeaderUpdated {
                shard_id,
                leader_id: Some(_),
                ..
            } = event
            {
                manager.refresh_shard_state(shard_id).await;
            }
        })
    })
}
