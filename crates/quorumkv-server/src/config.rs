//! Server configuration.

use std::path::PathBuf;

use clap::Parser;

use quorumkv_raft::{HostConfig, NodeConfig, ReplicaId, ShardId, StateMachineType};

use crate::error::Error;

/// Default raft transport address.
pub const DEFAULT_RAFT_ADDRESS: &str = "0.0.0.0:9101";

/// Default deadline of key/value and membership operations, in milliseconds.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 10_000;

/// quorumkv server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub node: NodeConfig,

    /// Shards to create on start if this host does not run them yet.
    pub bootstrap_shards: Vec<ShardId>,

    /// Replica id used for bootstrapped shards.
    pub replica_id: ReplicaId,

    /// State machine of bootstrapped shards.
    pub state_machine: StateMachineType,
}

impl ServerConfig {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            node: NodeConfig::new(HostConfig::new(data_dir)).with_request_timeout_ms(DEFAULT_REQUEST_TIMEOUT_MS),
            bootstrap_shards: Vec::new(),
            replica_id: 1,
            state_machine: StateMachineType::OnDiskKv,
        }
    }

    pub fn with_bootstrap_shard(mut self, shard_id: ShardId) -> Self {
        self.bootstrap_shards.push(shard_id);
        self
    }

    pub fn with_replica_id(mut self, replica_id: ReplicaId) -> Self {
        self.replica_id = replica_id;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new("./quorumkv-data")
    }
}

/// Command-line arguments for the server.
#[derive(Parser, Debug)]
#[command(name = "quorumkv-server")]
#[command(version, about = "quorumkv node", long_about = None)]
pub struct Args {
    /// Root directory for raft logs, stores, snapshots and shard state.
    #[arg(short, long, default_value = "./quorumkv-data")]
    pub data_dir: PathBuf,

    /// Address the raft transport listens on.
    #[arg(long, default_value = DEFAULT_RAFT_ADDRESS)]
    pub raft_addr: String,

    /// Address other hosts reach this one at. Defaults to --raft-addr.
    #[arg(long)]
    pub advertise_addr: Option<String>,

    /// Raft heartbeat interval in milliseconds.
    #[arg(long, default_value_t = 150)]
    pub heartbeat_ms: u64,

    /// Minimum election timeout in milliseconds.
    #[arg(long, default_value_t = 300)]
    pub election_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    #[arg(long, default_value_t = 500)]
    pub election_max_ms: u64,

    /// Applied entries between snapshots.
    #[arg(long, default_value_t = 10_000)]
    pub snapshot_threshold: u64,

    /// Per-RPC deadline of the raft transport in milliseconds.
    #[arg(long, default_value_t = 5_000)]
    pub rpc_timeout_ms: u64,

    /// Concurrent raft RPC handlers.
    #[arg(long, default_value_t = 4)]
    pub rpc_workers: usize,

    /// Deadline of client operations in milliseconds.
    #[arg(long, default_value_t = DEFAULT_REQUEST_TIMEOUT_MS)]
    pub request_timeout_ms: u64,

    /// Create this shard on start unless it is already hosted. Repeatable.
    #[arg(long = "bootstrap-shard")]
    pub bootstrap_shards: Vec<ShardId>,

    /// Replica id for bootstrapped shards.
    #[arg(long, default_value_t = 1)]
    pub replica_id: ReplicaId,

    /// State machine of bootstrapped shards: `kv` or `memory`.
    #[arg(long, default_value = "kv")]
    pub state_machine: String,
}

impl Args {
    /// Convert command-line arguments to server configuration.
    pub fn into_config(self) -> Result<ServerConfig, Error> {
        let advertise = self.advertise_addr.unwrap_or_else(|| self.raft_addr.clone());
        let host = HostConfig::new(self.data_dir)
            .with_raft_listen_addr(self.raft_addr)
            .with_raft_advertise_addr(advertise)
            .with_heartbeat_interval_ms(self.heartbeat_ms)
            .with_election_timeout_ms(self.election_min_ms, self.election_max_ms)
            .with_snapshot_threshold(self.snapshot_threshold)
            .with_rpc_timeout_ms(self.rpc_timeout_ms)
            .with_rpc_workers(self.rpc_workers);
        host.validate()?;

        if self.replica_id == 0 {
            return Err(Error::Config("replica id must be non-zero".into()));
        }

        Ok(ServerConfig {
            node: NodeConfig::new(host).with_request_timeout_ms(self.request_timeout_ms),
            bootstrap_shards: self.bootstrap_shards,
            replica_id: self.replica_id,
            state_machine: crate::parse_state_machine(&self.state_machine)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.node.host.data_dir, PathBuf::from("./quorumkv-data"));
        assert_eq!(config.node.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
        assert!(config.bootstrap_shards.is_empty());
        assert_eq!(config.replica_id, 1);
    }

    #[test]
    fn test_args_into_config() {
        let args = Args::parse_from([
            "quorumkv-server",
            "--data-dir",
            "/var/lib/quorumkv",
            "--raft-addr",
            "0.0.0.0:7000",
            "--advertise-addr",
            "10.0.0.5:7000",
            "--bootstrap-shard",
            "1000",
            "--bootstrap-shard",
            "1001",
            "--state-machine",
            "memory",
        ]);
        let config = args.into_config().unwrap();
        assert_eq!(config.node.host.raft_listen_addr, "0.0.0.0:7000");
        assert_eq!(config.node.host.raft_advertise_addr, "10.0.0.5:7000");
        assert_eq!(config.bootstrap_shards, vec![1000, 1001]);
        assert_eq!(config.state_machine, StateMachineType::InMemory);
    }

    #[test]
    fn test_invalid_args_are_rejected() {
        let args = Args::parse_from(["quorumkv-server", "--election-min-ms", "100", "--heartbeat-ms", "200"]);
        assert!(args.into_config().is_err());

        let args = Args::parse_from(["quorumkv-server", "--replica-id", "0"]);
        assert!(args.into_config().is_err());
    }
}
