//! Shard management: creating and reshaping shards, and the local record
//! of which shards this host runs.

mod manager;
pub mod membership;
mod store;

pub use manager::ShardManager;
pub use membership::{config_change_id, MembershipEntry};
pub use store::{ShardState, ShardStore};
