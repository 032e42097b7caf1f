//! Shard identifiers and the id range policy.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::Error;

/// Identifies one raft group.
pub type ShardId = u64;

/// Identifies one member of a raft group.
pub type ReplicaId = u64;

/// Disjoint shard id ranges.
///
/// The shard manager itself does not care which range an id falls in; the
/// transport layer checks that a caller only touches its authorized range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ShardRange {
    /// Internal bookkeeping shards.
    System,
    /// Regular tenant data shards.
    Tenant,
    /// Third-party extension shards.
    Plugin,
}

impl ShardRange {
    pub const SYSTEM_MIN: ShardId = 1;
    pub const SYSTEM_MAX: ShardId = 999;
    pub const TENANT_MIN: ShardId = 1_000;
    pub const TENANT_MAX: ShardId = 999_999_999;
    pub const PLUGIN_MIN: ShardId = 1_000_000_000;
    pub const PLUGIN_MAX: ShardId = ShardId::MAX;

    /// Classify a shard id. Returns `None` for 0.
    pub fn of(shard_id: ShardId) -> Option<Self> {
        match shard_id {
            0 => None,
            Self::SYSTEM_MIN..=Self::SYSTEM_MAX => Some(ShardRange::System),
            Self::TENANT_MIN..=Self::TENANT_MAX => Some(ShardRange::Tenant),
            _ => Some(ShardRange::Plugin),
        }
    }

    /// Inclusive bounds of this range.
    pub fn bounds(self) -> (ShardId, ShardId) {
        match self {
            ShardRange::System => (Self::SYSTEM_MIN, Self::SYSTEM_MAX),
            ShardRange::Tenant => (Self::TENANT_MIN, Self::TENANT_MAX),
            ShardRange::Plugin => (Self::PLUGIN_MIN, Self::PLUGIN_MAX),
        }
    }

    /// Check whether the id belongs to this range.
    pub fn contains(self, shard_id: ShardId) -> bool {
        Self::of(shard_id) == Some(self)
    }

    /// Reject ids outside `range`.
    pub fn check(range: ShardRange, shard_id: ShardId) -> Result<(), Error> {
        if range.contains(shard_id) {
            Ok(())
        } else {
            Err(Error::ShardOutOfRange {
                shard_id,
                range: range.name(),
            })
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ShardRange::System => "system",
            ShardRange::Tenant => "tenant",
            ShardRange::Plugin => "plugin",
        }
    }
}

impl fmt::Display for ShardRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
