//! Storage layer for raft: the log store, the replicated state machine
//! wrapper, client sessions and snapshots.

mod log_storage;
pub mod replicated;
mod session;
mod snapshot;

pub use log_storage::SledLogStore;
pub use replicated::ReplicaStateMachine;
pub use session::{SessionCheck, SessionRegistry};
pub use snapshot::{ReplicaSnapshot, ReplicaSnapshotBuilder, SnapshotStore, SNAPSHOT_VERSION};
