//! quorumkv protocol types.
//!
//! This crate defines the data model stored by every shard (accounts,
//! buckets and key/value pairs), the command envelope that crosses the
//! replicated log, and the client-visible [`Transaction`] projection of a
//! consensus session.
//!
//! # Serialization
//!
//! Everything that is replicated or stored derives `rkyv::Archive`,
//! `rkyv::Serialize` and `rkyv::Deserialize`; use the generated
//! `to_bytes`/`from_bytes` helpers:
//!
//! ```ignore
//! use quorumkv_proto::{KvRequest, KeyValue};
//!
//! let request = KvRequest::put_key(42, "logs", KeyValue::new("k", b"v".to_vec(), 1));
//! let bytes = request.to_bytes()?;
//! let decoded = KvRequest::from_bytes(&bytes)?;
//! ```

#[macro_use]
mod codec;

pub mod envelope;
pub mod error;
pub mod model;
pub mod shard;
pub mod transaction;

pub use envelope::{error_codes, KvRequest, KvResponse, ReplyKind, ReplyPayload, RequestKind, RequestPayload};
pub use error::Error;
pub use model::{current_millis, AccountDescriptor, BucketDescriptor, KeyValue};
pub use shard::{ReplicaId, ShardId, ShardRange};
pub use transaction::{series, Transaction};

/// Version stamped into every command envelope.
///
/// Replicas refuse envelopes carrying any other version, so bump this when
/// the envelope layout changes incompatibly.
pub const ENVELOPE_VERSION: u32 = 1;
