//! quorumkv storage engine.
//!
//! A transactional, hierarchical key/value store on sled. Accounts own
//! buckets, buckets own versioned keys. Every mutation runs in a single
//! sled transaction, together with the monotonic log index when the
//! mutation comes from the replicated log.

pub mod config;
pub mod engine;
pub mod error;
pub mod keys;
pub mod snapshot;

pub use config::StoreConfig;
pub use engine::KvEngine;
pub use error::Error;
pub use snapshot::StoreImage;
