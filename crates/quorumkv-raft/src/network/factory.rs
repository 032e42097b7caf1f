//! Factory for creating raft network connections.

use std::sync::Arc;
use std::time::Duration;

use openraft::network::RaftNetworkFactory;

use super::connections::ConnectionTracker;
use super::transport::NngRaftNetwork;
use crate::events::RaftEventListener;
use crate::types::{NodeId, ReplicaId, ReplicaNode, ShardId, TypeConfig};

/// Creates clients for one local replica. Each shard's raft instance owns
/// its own factory; the connection tracker is shared host-wide.
pub struct NngNetworkFactory {
    shard_id: ShardId,
    replica_id: ReplicaId,
    timeout: Duration,
    connections: Arc<ConnectionTracker>,
    listener: Arc<dyn RaftEventListener>,
}

impl NngNetworkFactory {
    pub fn new(
        shard_id: ShardId,
        replica_id: ReplicaId,
        connections: Arc<ConnectionTracker>,
        listener: Arc<dyn RaftEventListener>,
    ) -> Self {
        Self {
            shard_id,
            replica_id,
            timeout: Duration::from_secs(5),
            connections,
            listener,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl RaftNetworkFactory<TypeConfig> for NngNetworkFactory {
    type Network = NngRaftNetwork;

    async fn new_client(&mut self, target: NodeId, node: &ReplicaNode) -> Self::Network {
        tracing::debug!(
            shard_id = self.shard_id,
            from = self.replica_id,
            to = target,
            addr = %node.addr,
            "creating raft client"
        );
        NngRaftNetwork::new(
            self.shard_id,
            self.replica_id,
            target,
            node.clone(),
            self.connections.clone(),
            self.listener.clone(),
        )
        .with_timeout(self.timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoopListener;

    #[tokio::test]
    async fn test_factory_creates_client() {
        let listener: Arc<dyn RaftEventListener> = Arc::new(NoopListener);
        let tracker = Arc::new(ConnectionTracker::new(listener.clone()));
        let mut factory = NngNetworkFactory::new(5, 1, tracker, listener);

        let network = factory.new_client(2, &ReplicaNode::replica("localhost:9101")).await;
        assert_eq!(network.target(), 2);
        assert_eq!(network.address(), "localhost:9101");
    }
}
