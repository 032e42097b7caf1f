//! User state machines driven by the replicated log.
//!
//! A [`StateMachine`] sees only opaque payloads and log indexes. Sessions,
//! membership and snapshot framing are handled by the replica wrapper in
//! [`crate::storage::replicated`], so an implementation only has to apply
//! entries in order and produce a point-in-time image of itself.

mod kv;
mod memory;

use std::any::Any;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::types::{ReplicaId, ReplicaRole, ShardId};

pub use kv::KvStateMachine;
pub use memory::{MemoryOp, MemoryQuery, MemoryStateMachine, WitnessStateMachine};

/// One committed payload handed to [`StateMachine::update`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmEntry {
    pub index: u64,
    pub cmd: Vec<u8>,
}

/// Result of applying one [`SmEntry`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SmResult {
    pub value: u64,
    pub data: Vec<u8>,
}

/// Opaque state captured by [`StateMachine::prepare_snapshot`] and
/// consumed by [`StateMachine::save_snapshot`].
pub type SnapshotContext = Box<dyn Any + Send + Sync>;

/// A state machine shared between the apply loop, snapshot builders and
/// readers.
pub type SharedStateMachine = Arc<RwLock<Box<dyn StateMachine>>>;

/// Which implementation backs a replica.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StateMachineType {
    /// The hierarchical key/value store on disk.
    #[default]
    OnDiskKv,
    /// A volatile map, rebuilt from snapshot and log on restart.
    InMemory,
}

/// The contract between a shard's apply loop and the application state.
///
/// `update` calls are never concurrent for one instance. `lookup` may run
/// while an `update` is in progress on another thread.
pub trait StateMachine: Send + Sync {
    /// Open the backing state and return the last applied log index.
    fn open(&mut self) -> Result<u64>;

    /// Apply entries in log order, one result per entry.
    fn update(&mut self, entries: &[SmEntry]) -> Result<Vec<SmResult>>;

    /// Read-only query that bypasses the log.
    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>>;

    /// Durability barrier.
    fn sync(&self) -> Result<()>;

    /// Capture a consistent view to be written by `save_snapshot`.
    fn prepare_snapshot(&self) -> Result<SnapshotContext>;

    /// Write a captured view to the sink.
    fn save_snapshot(&self, ctx: SnapshotContext, writer: &mut dyn Write) -> Result<()>;

    /// Replace all state with the image read from the source.
    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()>;

    /// Release the backing state.
    fn close(&mut self) -> Result<()>;

    /// Whether applied state survives a restart without a snapshot.
    fn is_on_disk(&self) -> bool {
        false
    }
}

/// Build the state machine for a replica.
///
/// Witnesses always get a [`WitnessStateMachine`] whatever `sm_type` says.
pub fn create(
    sm_type: StateMachineType,
    role: ReplicaRole,
    shard_id: ShardId,
    replica_id: ReplicaId,
    dir: PathBuf,
    cache_capacity: u64,
) -> Box<dyn StateMachine> {
    match (role, sm_type) {
        (ReplicaRole::Witness, _) => Box::new(WitnessStateMachine::new()),
        (_, StateMachineType::OnDiskKv) => {
            Box::new(KvStateMachine::new(shard_id, replica_id, dir).with_cache_capacity(cache_capacity))
        }
        (_, StateMachineType::InMemory) => Box::new(MemoryStateMachine::new()),
    }
}
