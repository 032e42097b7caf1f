//! Client-visible projection of a consensus session.

use serde::{Deserialize, Serialize};

use crate::shard::ShardId;

/// Reserved series ids.
///
/// A real session proposes with series ids starting at [`FIRST_PROPOSAL`];
/// the other values mark sessions that must never be completed or closed.
pub mod series {
    /// Fire-and-forget proposals with no dedup.
    pub const NOOP: u64 = 0;
    /// First series id of a freshly registered session.
    pub const FIRST_PROPOSAL: u64 = 1;
    /// Session registration in flight.
    pub const REGISTRATION: u64 = u64::MAX - 1;
    /// Session unregistration in flight.
    pub const UNREGISTRATION: u64 = u64::MAX;

    /// Whether a series id is one of the reserved sentinels.
    pub fn is_sentinel(series_id: u64) -> bool {
        matches!(series_id, NOOP | REGISTRATION | UNREGISTRATION)
    }
}

/// A client session as seen by callers outside the process.
///
/// The value is passed back and forth between the caller and the
/// transaction manager; every commit returns a new value with an advanced
/// `transaction_id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Transaction {
    /// Shard the session belongs to.
    pub shard_id: ShardId,
    /// Session owner; also the key of the host-side session cache.
    pub client_id: u64,
    /// Series id the next proposal will carry.
    pub transaction_id: u64,
    /// Highest series id the client has seen a response for.
    pub responded_to: u64,
}

impl Transaction {
    /// A freshly registered session, ready for its first proposal.
    pub fn new(shard_id: ShardId, client_id: u64) -> Self {
        Self {
            shard_id,
            client_id,
            transaction_id: series::FIRST_PROPOSAL,
            responded_to: 0,
        }
    }

    /// A fire-and-forget session.
    pub fn noop(shard_id: ShardId, client_id: u64) -> Self {
        Self {
            shard_id,
            client_id,
            transaction_id: series::NOOP,
            responded_to: 0,
        }
    }

    /// Whether this is a fire-and-forget session.
    pub fn is_noop(&self) -> bool {
        self.transaction_id == series::NOOP
    }

    /// Whether this value may be committed or closed.
    pub fn is_completable(&self) -> bool {
        self.client_id != 0 && !series::is_sentinel(self.transaction_id)
    }

    /// The transaction after the current proposal has been answered.
    pub fn advanced(&self) -> Self {
        Self {
            responded_to: self.transaction_id,
            transaction_id: self.transaction_id + 1,
            ..*self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advance_is_strictly_increasing() {
        let txn = Transaction::new(1_000, 77);
        let next = txn.advanced();
        assert_eq!(next.transaction_id, 2);
        assert_eq!(next.responded_to, 1);
        assert!(next.advanced().transaction_id > next.transaction_id);
    }

    #[test]
    fn test_sentinels_are_not_completable() {
        assert!(!Transaction::noop(1_000, 77).is_completable());
        let mut txn = Transaction::new(1_000, 77);
        assert!(txn.is_completable());
        txn.transaction_id = series::REGISTRATION;
        assert!(!txn.is_completable());
        txn.transaction_id = series::UNREGISTRATION;
        assert!(!txn.is_completable());
        assert!(!Transaction::new(1_000, 0).is_completable());
    }
}
