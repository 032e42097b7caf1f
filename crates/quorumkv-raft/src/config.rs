//! Configuration for a node host and the raft groups it runs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use quorumkv_proto::ShardId;

use crate::error::{Error, Result};
use crate::types::ReplicaId;

/// Configuration shared by every raft group hosted in one process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Address the raft transport listens on.
    pub raft_listen_addr: String,

    /// Address other hosts use to reach this host. Membership records
    /// store this value, so it must be stable across restarts.
    pub raft_advertise_addr: String,

    /// Root directory for logs, state machines, snapshots and shard state.
    pub data_dir: PathBuf,

    /// Heartbeat interval in milliseconds.
    pub heartbeat_interval_ms: u64,

    /// Minimum election timeout in milliseconds.
    pub election_timeout_min_ms: u64,

    /// Maximum election timeout in milliseconds.
    pub election_timeout_max_ms: u64,

    /// Number of applied entries between snapshots.
    pub snapshot_threshold: u64,

    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: u64,

    /// Per-RPC deadline of the transport, in milliseconds.
    pub rpc_timeout_ms: u64,

    /// Concurrent RPC handlers of the raft server. A slow shard holds at
    /// most one of them.
    pub rpc_workers: usize,

    /// Page cache of each replica's key/value store, in bytes.
    pub store_cache_capacity: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            raft_listen_addr: "0.0.0.0:9101".to_string(),
            raft_advertise_addr: "127.0.0.1:9101".to_string(),
            data_dir: PathBuf::from("./quorumkv-data"),
            heartbeat_interval_ms: 150,
            election_timeout_min_ms: 300,
            election_timeout_max_ms: 500,
            snapshot_threshold: 10_000,
            max_entries_per_append: 100,
            rpc_timeout_ms: 5_000,
            rpc_workers: 4,
            store_cache_capacity: 16 * 1024 * 1024,
        }
    }
}

impl HostConfig {
    /// Create a configuration rooted at the given data directory.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Default::default()
        }
    }

    /// Set both the listen and the advertise address.
    pub fn with_raft_addr(mut self, addr: impl Into<String>) -> Self {
        let addr = addr.into();
        self.raft_listen_addr = addr.clone();
        self.raft_advertise_addr = addr;
        self
    }

    /// Set the raft listen address.
    pub fn with_raft_listen_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_listen_addr = addr.into();
        self
    }

    /// Set the raft advertise address.
    pub fn with_raft_advertise_addr(mut self, addr: impl Into<String>) -> Self {
        self.raft_advertise_addr = addr.into();
        self
    }

    /// Set the data directory.
    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the heartbeat interval.
    pub fn with_heartbeat_interval_ms(mut self, ms: u64) -> Self {
        self.heartbeat_interval_ms = ms;
        self
    }

    /// Set the election timeout range.
    pub fn with_election_timeout_ms(mut self, min_ms: u64, max_ms: u64) -> Self {
        self.election_timeout_min_ms = min_ms;
        self.election_timeout_max_ms = max_ms;
        self
    }

    /// Set the snapshot threshold.
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    /// Set the per-RPC transport deadline.
    pub fn with_rpc_timeout_ms(mut self, ms: u64) -> Self {
        self.rpc_timeout_ms = ms;
        self
    }

    /// Set the number of raft server workers.
    pub fn with_rpc_workers(mut self, workers: usize) -> Self {
        self.rpc_workers = workers;
        self
    }

    /// Set the page cache of each replica store.
    pub fn with_store_cache_capacity(mut self, bytes: u64) -> Self {
        self.store_cache_capacity = bytes;
        self
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    /// Check the timing parameters.
    pub fn validate(&self) -> Result<()> {
        if self.raft_advertise_addr.is_empty() {
            return Err(Error::Initialization("raft advertise address is empty".into()));
        }
        if self.rpc_workers == 0 {
            return Err(Error::Initialization("rpc workers must be at least 1".into()));
        }
        if self.election_timeout_min_ms <= self.heartbeat_interval_ms {
            return Err(Error::Initialization(format!(
                "election timeout {}ms must exceed heartbeat interval {}ms",
                self.election_timeout_min_ms, self.heartbeat_interval_ms
            )));
        }
        if self.election_timeout_max_ms <= self.election_timeout_min_ms {
            return Err(Error::Initialization(format!(
                "election timeout range {}..{}ms is empty",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        Ok(())
    }

    /// The openraft configuration of one shard's group.
    pub fn raft_config(&self, shard_id: ShardId) -> Result<openraft::Config> {
        let config = openraft::Config {
            cluster_name: format!("quorumkv-shard-{shard_id}"),
            heartbeat_interval: self.heartbeat_interval_ms,
            election_timeout_min: self.election_timeout_min_ms,
            election_timeout_max: self.election_timeout_max_ms,
            max_payload_entries: self.max_entries_per_append,
            snapshot_policy: openraft::SnapshotPolicy::LogsSinceLast(self.snapshot_threshold),
            max_in_snapshot_log_to_keep: 0,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| Error::Initialization(format!("invalid raft config for shard {shard_id}: {e}")))
    }

    /// Directory of the sled database holding shard-state records.
    pub fn shard_state_dir(&self) -> PathBuf {
        self.data_dir.join("shard-state")
    }

    /// On-disk locations of one replica.
    pub fn replica_paths(&self, shard_id: ShardId, replica_id: ReplicaId) -> ReplicaPaths {
        ReplicaPaths::new(&self.data_dir, shard_id, replica_id)
    }
}

/// Deterministic on-disk layout of one (shard, replica) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaPaths {
    pub root: PathBuf,
    pub raft_log: PathBuf,
    pub kv: PathBuf,
    pub snapshots: PathBuf,
}

impl ReplicaPaths {
    pub fn new(data_dir: &Path, shard_id: ShardId, replica_id: ReplicaId) -> Self {
        let root = data_dir
            .join("shards")
            .join(shard_id.to_string())
            .join(replica_id.to_string());
        Self {
            raft_log: root.join("raft-log"),
            kv: root.join("kv"),
            snapshots: root.join("snapshots"),
            root,
        }
    }

    /// Whether anything was ever written for this replica.
    pub fn exists(&self) -> bool {
        self.raft_log.exists()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_config_builder() {
        let config = HostConfig::new("/tmp/qkv")
            .with_raft_addr("127.0.0.1:7000")
            .with_heartbeat_interval_ms(50)
            .with_election_timeout_ms(200, 400);

        assert_eq!(config.raft_listen_addr, "127.0.0.1:7000");
        assert_eq!(config.raft_advertise_addr, "127.0.0.1:7000");
        assert_eq!(config.heartbeat_interval_ms, 50);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_inverted_timeouts() {
        let config = HostConfig::default().with_election_timeout_ms(500, 300);
        assert!(config.validate().is_err());

        let config = HostConfig::default().with_heartbeat_interval_ms(400);
        assert!(config.validate().is_err());

        let config = HostConfig::default().with_rpc_workers(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_replica_paths_are_derived_from_ids() {
        let paths = ReplicaPaths::new(Path::new("/data"), 1_000, 3);
        assert_eq!(paths.root, PathBuf::from("/data/shards/1000/3"));
        assert_eq!(paths.kv, PathBuf::from("/data/shards/1000/3/kv"));
        assert_ne!(paths, ReplicaPaths::new(Path::new("/data"), 1_000, 4));
    }

    #[test]
    fn test_raft_config_is_per_shard() {
        let config = HostConfig::default();
        let raft = config.raft_config(7).unwrap();
        assert_eq!(raft.cluster_name, "quorumkv-shard-7");
        assert_eq!(raft.heartbeat_interval, 150);
    }
}
