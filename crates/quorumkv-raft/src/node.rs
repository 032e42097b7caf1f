//! Composition of a full quorumkv node.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::HostConfig;
use crate::error::Result;
use crate::events::{Broker, EventBus, LifecycleManager, LocalBroker, RaftEventPublisher};
use crate::host::NodeHost;
use crate::kv::KvStore;
use crate::shard::{ShardManager, ShardStore};
use crate::txn::TransactionManager;

/// Configuration of a [`Node`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub host: HostConfig,
    /// Deadline of key/value operations issued through [`Node::kv`], in
    /// milliseconds. Zero means the host's RPC timeout.
    pub request_timeout_ms: u64,
}

impl NodeConfig {
    pub fn new(host: HostConfig) -> Self {
        Self {
            host,
            request_timeout_ms: 0,
        }
    }

    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        if self.request_timeout_ms == 0 {
            self.host.rpc_timeout()
        } else {
            Duration::from_millis(self.request_timeout_ms)
        }
    }
}

/// A host with its shard manager, transaction manager, key/value service
/// and event plumbing wired together.
pub struct Node {
    config: NodeConfig,
    broker: Arc<LocalBroker>,
    host: Arc<NodeHost>,
    shards: Arc<ShardManager>,
    txns: Arc<TransactionManager>,
    kv: Arc<KvStore>,
    bus: Arc<EventBus>,
    lifecycle: LifecycleManager,
}

impl Node {
    /// Build every component, start event dispatch and restart the replicas
    /// this host ran before.
    pub async fn start(config: NodeConfig) -> Result<Self> {
        config.host.validate()?;
        let broker = Arc::new(LocalBroker::new());
        let publisher = Arc::new(RaftEventPublisher::new(broker.clone()));
        let host = Arc::new(NodeHost::new(config.host.clone(), publisher).await?);

        let store = Arc::new(ShardStore::open(config.host.shard_state_dir())?);
        let shards = Arc::new(ShardManager::new(host.clone(), store));
        let txns = Arc::new(TransactionManager::new(host.clone()));
        let kv = Arc::new(KvStore::new(txns.clone(), host.clone(), config.request_timeout()));

        let bus = Arc::new(EventBus::new(broker.clone()));
        bus.run()?;
        let lifecycle = LifecycleManager::new(shards.clone(), bus.clone());
        let restarted = lifecycle.start().await?;

        tracing::info!(
            addr = %host.raft_address(),
            data_dir = %config.host.data_dir.display(),
            restarted,
            "node started"
        );
        Ok(Self {
            config,
            broker,
            host,
            shards,
            txns,
            kv,
            bus,
            lifecycle,
        })
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        self.broker.clone()
    }

    pub fn host(&self) -> &Arc<NodeHost> {
        &self.host
    }

    pub fn shards(&self) -> &Arc<ShardManager> {
        &self.shards
    }

    pub fn transactions(&self) -> &Arc<TransactionManager> {
        &self.txns
    }

    pub fn kv(&self) -> &Arc<KvStore> {
        &self.kv
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Stop the components in reverse start order.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!(addr = %self.host.raft_address(), "node shutting down");
        let result = self.lifecycle.stop().await;
        self.bus.stop().await;
        self.host.close().await;
        result
    }
}

/// Starts at most one [`Node`] per data directory.
#[derive(Default)]
pub struct NodeFactory {
    nodes: Mutex<HashMap<PathBuf, Arc<Node>>>,
}

impl NodeFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The node running on `config`'s data directory, started if needed.
    /// An already running node keeps its original configuration.
    pub async fn get_or_start(&self, config: NodeConfig) -> Result<Arc<Node>> {
        let mut nodes = self.nodes.lock().await;
        if let Some(node) = nodes.get(&config.host.data_dir) {
            return Ok(node.clone());
        }
        let data_dir = config.host.data_dir.clone();
        let node = Arc::new(Node::start(config).await?);
        nodes.insert(data_dir, node.clone());
        Ok(node)
    }

    /// Shut down and forget the node on `data_dir`.
    pub async fn shutdown(&self, data_dir: &std::path::Path) -> Result<bool> {
        let node = self.nodes.lock().await.remove(data_dir);
        match node {
            Some(node) => {
                node.shutdown().await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
