//! Stored data model: accounts own buckets, buckets own keys.

use rkyv::{Archive, Deserialize, Serialize};
use serde::{Deserialize as SerdeDeserialize, Serialize as SerdeSerialize};

/// Get the current wall-clock time in milliseconds since the Unix epoch.
///
/// Only the proposing side reads the clock; replicas use the timestamp
/// carried in the request envelope.
pub fn current_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Top-level tenant container.
///
/// `bucket_count` always equals `buckets.len()`; the storage engine keeps
/// both in step inside the same transaction that creates or drops a bucket.
#[derive(
    Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct AccountDescriptor {
    /// Non-zero account identifier.
    pub account_id: u64,
    /// Owner of the account.
    pub owner: String,
    /// Creation time in milliseconds.
    pub created: u64,
    /// Last modification time in milliseconds.
    pub last_updated: u64,
    /// Number of buckets in the account.
    pub bucket_count: u64,
    /// Names of the buckets in the account.
    pub buckets: Vec<String>,
}

impl AccountDescriptor {
    /// Create a new, empty account descriptor stamped with `now`.
    pub fn new(account_id: u64, owner: impl Into<String>, now: u64) -> Self {
        Self {
            account_id,
            owner: owner.into(),
            created: now,
            last_updated: now,
            bucket_count: 0,
            buckets: Vec::new(),
        }
    }

    /// Check whether the account lists a bucket with this name.
    pub fn has_bucket(&self, name: &str) -> bool {
        self.buckets.iter().any(|b| b == name)
    }

    /// Append a bucket name and bump the count.
    pub fn add_bucket(&mut self, name: impl Into<String>, now: u64) {
        let name = name.into();
        if !self.has_bucket(&name) {
            self.buckets.push(name);
        }
        self.bucket_count = self.buckets.len() as u64;
        self.last_updated = now;
    }

    /// Drop every occurrence of a bucket name and recompute the count.
    pub fn remove_bucket(&mut self, name: &str, now: u64) {
        self.buckets.retain(|b| b != name);
        self.bucket_count = self.buckets.len() as u64;
        self.last_updated = now;
    }
}

impl_rkyv_codec!(AccountDescriptor);

/// A named bucket inside an account.
#[derive(
    Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct BucketDescriptor {
    /// Bucket name, unique within its account.
    pub name: String,
    /// Owner of the bucket.
    pub owner: String,
    /// Total size of stored values in bytes.
    pub size: u64,
    /// Number of keys in the bucket.
    pub key_count: u64,
    /// Creation time in milliseconds.
    pub created: u64,
    /// Last modification time in milliseconds.
    pub last_updated: u64,
}

impl BucketDescriptor {
    /// Create a new, empty bucket descriptor stamped with `now`.
    pub fn new(name: impl Into<String>, owner: impl Into<String>, now: u64) -> Self {
        Self {
            name: name.into(),
            owner: owner.into(),
            size: 0,
            key_count: 0,
            created: now,
            last_updated: now,
        }
    }
}

impl_rkyv_codec!(BucketDescriptor);

/// A versioned key/value pair.
#[derive(
    Debug, Clone, PartialEq, Eq, Default, Archive, Serialize, Deserialize, SerdeSerialize, SerdeDeserialize,
)]
pub struct KeyValue {
    /// The key.
    pub key: Vec<u8>,
    /// The value.
    pub value: Vec<u8>,
    /// Monotonic version; each accepted write advances it by exactly one.
    pub version: u64,
    /// Proposal-time millis of the write that created the key.
    pub create_revision: u64,
    /// Proposal-time millis of the last write.
    pub mod_revision: u64,
    /// Reserved.
    pub lease: u64,
}

impl KeyValue {
    /// Create a key/value pair carrying the version the writer expects to install.
    pub fn new(key: impl Into<Vec<u8>>, value: Vec<u8>, version: u64) -> Self {
        Self {
            key: key.into(),
            value,
            version,
            create_revision: 0,
            mod_revision: 0,
            lease: 0,
        }
    }

    /// Set the create and mod revisions.
    pub fn with_revisions(mut self, create_revision: u64, mod_revision: u64) -> Self {
        self.create_revision = create_revision;
        self.mod_revision = mod_revision;
        self
    }

    /// Key as a lossy UTF-8 string, for logging.
    pub fn key_str(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.key)
    }
}

impl_rkyv_codec!(KeyValue);
