//! Raft log storage of one replica, backed by sled.

use std::fmt::Debug;
use std::ops::{Bound, RangeBounds};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{LogFlushed, RaftLogReader, RaftLogStorage};
use openraft::{LogState, OptionalSend, StorageError, StorageIOError, Vote};
use parking_lot::RwLock;
use sled::{Batch, Db, Tree};

use crate::error::Error;
use crate::events::{RaftEvent, RaftEventListener};
use crate::types::{LogEntry, LogId, NodeId, ReplicaId, ShardId, TypeConfig};

const LOG_TREE: &str = "raft_log";
const VOTE_TREE: &str = "raft_vote";
const STATE_TREE: &str = "raft_state";

const KEY_VOTE: &[u8] = b"vote";
const KEY_LAST_PURGED: &[u8] = b"last_purged_log_id";

/// Log entries keyed by big-endian index, plus the vote and the last
/// purged log id.
///
/// Clones share the trees and the cached purge point, so a reader handed
/// to openraft observes purges made through the writer.
#[derive(Clone)]
pub struct SledLogStore {
    shard_id: ShardId,
    replica_id: ReplicaId,
    db: Db,
    log_tree: Tree,
    vote_tree: Tree,
    state_tree: Tree,
    last_purged: Arc<RwLock<Option<LogId>>>,
    listener: Arc<dyn RaftEventListener>,
}

impl SledLogStore {
    /// Open the log trees inside a replica's raft-log database.
    pub fn open(
        shard_id: ShardId,
        replica_id: ReplicaId,
        db: Db,
        listener: Arc<dyn RaftEventListener>,
    ) -> Result<Self, Error> {
        let log_tree = db.open_tree(LOG_TREE)?;
        let vote_tree = db.open_tree(VOTE_TREE)?;
        let state_tree = db.open_tree(STATE_TREE)?;
        let last_purged = Self::load_last_purged(&state_tree)?;

        Ok(Self {
            shard_id,
            replica_id,
            db,
            log_tree,
            vote_tree,
            state_tree,
            last_purged: Arc::new(RwLock::new(last_purged)),
            listener,
        })
    }

    fn log_key(index: u64) -> [u8; 8] {
        index.to_be_bytes()
    }

    fn load_last_purged(state_tree: &Tree) -> Result<Option<LogId>, Error> {
        match state_tree.get(KEY_LAST_PURGED)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_last_purged(&self, log_id: LogId) -> Result<(), Error> {
        self.state_tree.insert(KEY_LAST_PURGED, serde_json::to_vec(&log_id)?)?;
        self.state_tree.flush()?;
        *self.last_purged.write() = Some(log_id);
        Ok(())
    }

    fn last_entry_log_id(&self) -> Result<Option<LogId>, Error> {
        match self.log_tree.last()? {
            Some((_, value)) => {
                let entry: LogEntry = serde_json::from_slice(&value)?;
                Ok(Some(entry.log_id))
            }
            None => Ok(None),
        }
    }

    /// Remove every entry whose key falls in the range.
    fn remove_range(&self, range: impl RangeBounds<[u8; 8]>) -> Result<usize, Error> {
        let mut batch = Batch::default();
        let mut removed = 0;
        for item in self.log_tree.range(range) {
            let (key, _) = item?;
            batch.remove(key);
            removed += 1;
        }
        self.log_tree.apply_batch(batch)?;
        Ok(removed)
    }

    /// The sled database the log lives in.
    pub fn db(&self) -> &Db {
        &self.db
    }
}

impl RaftLogReader<TypeConfig> for SledLogStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<LogEntry>, StorageError<NodeId>> {
        let start = match range.start_bound() {
            Bound::Included(&i) => Self::log_key(i),
            Bound::Excluded(&i) => Self::log_key(i.saturating_add(1)),
            Bound::Unbounded => Self::log_key(0),
        };
        let end = match range.end_bound() {
            Bound::Included(&i) => Bound::Included(Self::log_key(i)),
            Bound::Excluded(&i) => Bound::Excluded(Self::log_key(i)),
            Bound::Unbounded => Bound::Unbounded,
        };

        let mut entries = Vec::new();
        for item in self.log_tree.range((Bound::Included(start), end)) {
            let (_, value) = item.map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            let entry: LogEntry =
                serde_json::from_slice(&value).map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;
            entries.push(entry);
        }
        Ok(entries)
    }
}

impl RaftLogStorage<TypeConfig> for SledLogStore {
    type LogReader = Self;

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last_purged = *self.last_purged.read();
        let last_entry = self
            .last_entry_log_id()
            .map_err(|e| StorageIOError::read_logs(AnyError::new(&e)))?;

        Ok(LogState {
            last_purged_log_id: last_purged,
            // An empty log after a purge still ends at the purge point.
            last_log_id: last_entry.or(last_purged),
        })
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let bytes = serde_json::to_vec(vote).map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .insert(KEY_VOTE, bytes)
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        self.vote_tree
            .flush()
            .map_err(|e| StorageIOError::write_vote(AnyError::new(&e)))?;
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        let bytes = self
            .vote_tree
            .get(KEY_VOTE)
            .map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
        match bytes {
            Some(bytes) => {
                let vote = serde_json::from_slice(&bytes).map_err(|e| StorageIOError::read_vote(AnyError::new(&e)))?;
                Ok(Some(vote))
            }
            None => Ok(None),
        }
    }

    async fn append<I>(&mut self, entries: I, callback: LogFlushed<TypeConfig>) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + Send,
        I::IntoIter: Send,
    {
        let mut batch = Batch::default();
        for entry in entries {
            let value = serde_json::to_vec(&entry).map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
            batch.insert(&Self::log_key(entry.log_id.index)[..], value);
        }
        self.log_tree
            .apply_batch(batch)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.log_tree
            .flush()
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        callback.log_io_completed(Ok(()));
        Ok(())
    }

    async fn truncate(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        let removed = self
            .remove_range(Self::log_key(log_id.index)..)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        tracing::debug!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            from = log_id.index,
            removed,
            "truncated raft log"
        );
        Ok(())
    }

    async fn purge(&mut self, log_id: LogId) -> Result<(), StorageError<NodeId>> {
        let removed = self
            .remove_range(..=Self::log_key(log_id.index))
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;
        self.save_last_purged(log_id)
            .map_err(|e| StorageIOError::write_logs(AnyError::new(&e)))?;

        tracing::debug!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            upto = log_id.index,
            removed,
            "purged raft log"
        );
        self.listener.on_event(RaftEvent::LogDbCompacted {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use openraft::{CommittedLeaderId, EntryPayload};

    use super::*;
    use crate::events::NoopListener;

    fn entry(index: u64, term: u64) -> LogEntry {
        LogEntry {
            log_id: LogId::new(CommittedLeaderId::new(term, 1), index),
            payload: EntryPayload::Blank,
        }
    }

    fn store(db: Db) -> SledLogStore {
        SledLogStore::open(1_000, 1, db, Arc::new(NoopListener)).unwrap()
    }

    fn temp_db() -> Db {
        sled::Config::new().temporary(true).open().unwrap()
    }

    // `append` needs a LogFlushed callback that only openraft can build.
    fn insert(store: &SledLogStore, entries: &[LogEntry]) {
        for e in entries {
            let value = serde_json::to_vec(e).unwrap();
            store.log_tree.insert(SledLogStore::log_key(e.log_id.index), value).unwrap();
        }
    }

    #[tokio::test]
    async fn test_range_reads() {
        let mut store = store(temp_db());
        insert(&store, &[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 2)]);

        assert_eq!(store.try_get_log_entries(1..4).await.unwrap().len(), 3);
        assert_eq!(store.try_get_log_entries(2..=4).await.unwrap().len(), 3);
        let tail = store.try_get_log_entries(3..).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[1].log_id.index, 4);
    }

    #[tokio::test]
    async fn test_truncate_keeps_prefix() {
        let mut store = store(temp_db());
        insert(&store, &[entry(1, 1), entry(2, 1), entry(3, 1), entry(4, 1)]);

        store.truncate(LogId::new(CommittedLeaderId::new(1, 1), 3)).await.unwrap();
        let left = store.try_get_log_entries(..).await.unwrap();
        assert_eq!(left.iter().map(|e| e.log_id.index).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn test_purge_everything_keeps_last_log_id() {
        let mut store = store(temp_db());
        insert(&store, &[entry(1, 1), entry(2, 1), entry(3, 1)]);

        let upto = LogId::new(CommittedLeaderId::new(1, 1), 3);
        store.purge(upto).await.unwrap();

        assert!(store.try_get_log_entries(..).await.unwrap().is_empty());
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id, Some(upto));
        assert_eq!(state.last_log_id, Some(upto));
    }

    #[tokio::test]
    async fn test_reader_sees_purge_through_writer() {
        let mut writer = store(temp_db());
        insert(&writer, &[entry(1, 1), entry(2, 1)]);
        let mut reader = writer.get_log_reader().await;

        writer.purge(LogId::new(CommittedLeaderId::new(1, 1), 1)).await.unwrap();
        assert_eq!(*reader.last_purged.read(), Some(LogId::new(CommittedLeaderId::new(1, 1), 1)));
        assert_eq!(reader.try_get_log_entries(..).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_vote_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let vote = Vote::new(3, 1);
        {
            let mut store = store(sled::open(dir.path()).unwrap());
            assert!(store.read_vote().await.unwrap().is_none());
            store.save_vote(&vote).await.unwrap();
        }
        let mut store = store(sled::open(dir.path()).unwrap());
        assert_eq!(store.read_vote().await.unwrap(), Some(vote));
    }
}
