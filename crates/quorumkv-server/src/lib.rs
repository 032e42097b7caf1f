//! quorumkv server library.
//!
//! Command-line configuration and startup of a single quorumkv node.

pub mod config;
pub mod error;

pub use config::{Args, ServerConfig};
pub use error::Error;

use std::sync::Arc;

use quorumkv_proto::ShardRange;
use quorumkv_raft::{Node, NodeFactory, ShardId, StateMachineType};

/// Start the node described by `config` and create any requested shard
/// that this host does not already run.
pub async fn start(factory: &NodeFactory, config: &ServerConfig) -> Result<Arc<Node>, Error> {
    for &shard_id in &config.bootstrap_shards {
        check_bootstrap_shard(shard_id)?;
    }
    let node = factory.get_or_start(config.node.clone()).await?;

    for &shard_id in &config.bootstrap_shards {
        if node.host().local_replica(shard_id).is_some() {
            tracing::info!(shard_id, "shard already hosted, not bootstrapping");
            continue;
        }
        let membership = node
            .shards()
            .new_shard(shard_id, config.replica_id, config.state_machine, config.node.request_timeout())
            .await?;
        tracing::info!(
            shard_id,
            replica_id = config.replica_id,
            config_change_id = membership.config_change_id,
            "bootstrapped shard"
        );
    }
    Ok(node)
}

fn check_bootstrap_shard(shard_id: ShardId) -> Result<(), Error> {
    match ShardRange::of(shard_id) {
        Some(ShardRange::Tenant) | Some(ShardRange::System) => Ok(()),
        Some(range) => Err(Error::Config(format!(
            "shard {shard_id} is in the {} range and cannot be bootstrapped here",
            range.name()
        ))),
        None => Err(Error::Config(format!("shard id {shard_id} is not valid"))),
    }
}

/// Parse a state machine type name as accepted on the command line.
pub fn parse_state_machine(name: &str) -> Result<StateMachineType, Error> {
    match name {
        "kv" | "on-disk-kv" => Ok(StateMachineType::OnDiskKv),
        "memory" | "in-memory" => Ok(StateMachineType::InMemory),
        other => Err(Error::Config(format!("unknown state machine type {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bootstrap_shard_ranges() {
        assert!(check_bootstrap_shard(1_000).is_ok());
        assert!(check_bootstrap_shard(5).is_ok());
        assert!(check_bootstrap_shard(0).is_err());
        assert!(check_bootstrap_shard(2_000_000_000).is_err());
    }

    #[test]
    fn test_parse_state_machine() {
        assert_eq!(parse_state_machine("kv").unwrap(), StateMachineType::OnDiskKv);
        assert_eq!(parse_state_machine("memory").unwrap(), StateMachineType::InMemory);
        assert!(parse_state_machine("btree").is_err());
    }
}
