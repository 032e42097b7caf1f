//! quorumkv raft - sharded, replicated hosting of the quorumkv store.
//!
//! Each shard is an independent openraft group. One process hosts at most
//! one replica of any given shard, but any number of shards:
//! - [`NodeHost`] runs the local groups, their nng transport, fenced
//!   membership changes, client sessions and linearizable reads
//! - [`ShardManager`] creates and reshapes shards and keeps the local
//!   [`ShardStore`] bookkeeping in step
//! - [`TransactionManager`] exposes client sessions as [`Transaction`]s,
//!   and [`KvStore`] issues typed key/value operations under them
//! - [`EventBus`] and [`LifecycleManager`] turn raft events into membership
//!   refreshes and restart previously hosted replicas on start
//!
//! # Usage
//!
//! ```ignore
//! use quorumkv_raft::{HostConfig, Node, NodeConfig, StateMachineType};
//!
//! let node = Node::start(NodeConfig::new(HostConfig::new("/var/lib/quorumkv"))).await?;
//! node.shards().new_shard(1_000, 1, StateMachineType::OnDiskKv, timeout).await?;
//!
//! let txn = node.transactions().get_transaction(1_000, timeout).await?;
//! node.kv().create_account(&txn, 42, "owner@example.com").await?;
//! let txn = node.transactions().commit(&txn)?;
//! ```

pub mod config;
pub mod error;
pub mod events;
pub mod host;
pub mod kv;
pub mod network;
pub mod node;
pub mod shard;
pub mod statemachine;
pub mod storage;
pub mod txn;
pub mod types;

pub use config::{HostConfig, ReplicaPaths};
pub use error::{Error, OperationResult, Result};
pub use events::{EventBus, EventKind, LifecycleManager, RaftEvent, RaftEventListener};
pub use host::{LocalReplica, NodeHost, StartOptions};
pub use kv::KvStore;
pub use node::{Node, NodeConfig, NodeFactory};
pub use shard::{MembershipEntry, ShardManager, ShardState, ShardStore};
pub use statemachine::{SmEntry, SmResult, StateMachine, StateMachineType};
pub use txn::{Session, TransactionManager};
pub use types::{NodeId, ReplicaId, ReplicaNode, ReplicaRole, ShardId, TypeConfig};

pub use quorumkv_proto::Transaction;
