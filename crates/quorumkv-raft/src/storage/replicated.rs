//! The replicated state machine openraft drives for one replica.

use std::collections::{BTreeSet, HashMap};
use std::io::Cursor;
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftStateMachine, Snapshot};
use openraft::{EntryPayload, OptionalSend, StorageError, StorageIOError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sled::{Db, Tree};

use quorumkv_proto::series;

use super::session::{SessionCheck, SessionRegistry};
use super::snapshot::{ReplicaSnapshot, ReplicaSnapshotBuilder, SnapshotStore};
use crate::error::{Error, Result};
use crate::events::{RaftEvent, RaftEventListener};
use crate::statemachine::{SharedStateMachine, SmEntry};
use crate::types::{
    Command, CommandResult, LogEntry, LogId, Membership, NodeId, ReplicaId, ShardId, SnapshotMeta,
    StoredMembership, TypeConfig,
};

const STATE_TREE: &str = "replica_state";
const KEY_STATE: &[u8] = b"applied";

/// State replicated alongside the user state machine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ReplicaState {
    last_applied: Option<LogId>,
    membership: StoredMembership,
    removed: BTreeSet<ReplicaId>,
    sessions: SessionRegistry,
}

/// A user payload waiting to be applied, and where its result goes.
struct Pending {
    slot: usize,
    entry: SmEntry,
    session: Option<(u64, u64)>,
}

/// Wraps a user [`StateMachine`](crate::statemachine::StateMachine) with
/// client sessions, the removed-replica set and snapshot framing.
///
/// For on-disk user state the wrapper state is persisted after every
/// batch, once the user state has been synced, so it never runs ahead of
/// what the user state machine has made durable. Volatile replicas start
/// from their latest snapshot and replay the log from there.
pub struct ReplicaStateMachine {
    shard_id: ShardId,
    replica_id: ReplicaId,
    user: SharedStateMachine,
    state: ReplicaState,
    removed: Arc<RwLock<BTreeSet<ReplicaId>>>,
    state_tree: Option<Tree>,
    snapshots: SnapshotStore,
    listener: Arc<dyn RaftEventListener>,
}

impl ReplicaStateMachine {
    /// Open the user state machine and load the wrapper state.
    pub fn open(
        shard_id: ShardId,
        replica_id: ReplicaId,
        user: SharedStateMachine,
        db: &Db,
        snapshots: SnapshotStore,
        listener: Arc<dyn RaftEventListener>,
    ) -> Result<Self> {
        let user_index = user.write().open()?;
        let on_disk = user.read().is_on_disk();

        let mut sm = Self {
            shard_id,
            replica_id,
            user,
            state: ReplicaState::default(),
            removed: Arc::new(RwLock::new(BTreeSet::new())),
            state_tree: None,
            snapshots,
            listener,
        };

        if on_disk {
            let tree = db.open_tree(STATE_TREE)?;
            if let Some(bytes) = tree.get(KEY_STATE)? {
                sm.state = serde_json::from_slice(&bytes)?;
            }
            sm.state_tree = Some(tree);
        } else if let Some((meta, data)) = sm.snapshots.load()? {
            sm.restore(&meta, &data)?;
        }
        *sm.removed.write() = sm.state.removed.clone();

        tracing::info!(
            shard_id,
            replica_id,
            user_index,
            last_applied = ?sm.state.last_applied,
            sessions = sm.state.sessions.len(),
            "opened replica state machine"
        );
        Ok(sm)
    }

    /// Replica ids removed from the shard, kept current as entries apply.
    pub fn removed_handle(&self) -> Arc<RwLock<BTreeSet<ReplicaId>>> {
        self.removed.clone()
    }

    fn apply_membership(&mut self, log_id: LogId, membership: Membership) {
        let before: BTreeSet<ReplicaId> = self.state.membership.membership().nodes().map(|(id, _)| *id).collect();
        let after: BTreeSet<ReplicaId> = membership.nodes().map(|(id, _)| *id).collect();
        for gone in before.difference(&after) {
            tracing::info!(shard_id = self.shard_id, replica_id = *gone, "replica left the shard");
            self.state.removed.insert(*gone);
        }
        self.state.membership = StoredMembership::new(Some(log_id), membership);
    }

    /// Apply pending payloads as one batch, or one by one if the batch
    /// holds a payload the user state machine refuses.
    fn update_user(&self, pending: &[Pending]) -> Result<Vec<CommandResult>> {
        let entries: Vec<SmEntry> = pending.iter().map(|p| p.entry.clone()).collect();
        let mut user = self.user.write();

        match user.update(&entries) {
            Ok(results) if results.len() == entries.len() => Ok(results
                .into_iter()
                .map(|r| CommandResult::applied(r.value, r.data))
                .collect()),
            Ok(results) => Err(Error::Internal(format!(
                "state machine returned {} results for {} entries",
                results.len(),
                entries.len()
            ))),
            Err(Error::UnsupportedMethod(reason)) => {
                tracing::warn!(shard_id = self.shard_id, %reason, "batch refused, applying entries one by one");
                let mut out = Vec::with_capacity(entries.len());
                for entry in &entries {
                    match user.update(std::slice::from_ref(entry)) {
                        Ok(mut results) => {
                            let r = results.pop().unwrap_or_default();
                            out.push(CommandResult::applied(r.value, r.data));
                        }
                        Err(Error::UnsupportedMethod(reason)) => out.push(CommandResult::Rejected(reason)),
                        Err(e) => return Err(e),
                    }
                }
                Ok(out)
            }
            Err(e) => Err(e),
        }
    }

    fn persist(&self) -> Result<()> {
        let Some(tree) = &self.state_tree else {
            return Ok(());
        };
        self.user.read().sync()?;
        tree.insert(KEY_STATE, serde_json::to_vec(&self.state)?)?;
        Ok(())
    }

    fn restore(&mut self, meta: &SnapshotMeta, data: &[u8]) -> Result<()> {
        let snapshot = ReplicaSnapshot::from_bytes(data)?;
        self.user.write().recover_from_snapshot(&mut snapshot.user_image.as_slice())?;
        self.state = ReplicaState {
            last_applied: meta.last_log_id,
            membership: meta.last_membership.clone(),
            removed: snapshot.removed,
            sessions: snapshot.sessions,
        };
        *self.removed.write() = self.state.removed.clone();
        Ok(())
    }

    /// Resolve one entry, or queue its payload for the user state machine.
    fn classify(
        &mut self,
        entry: LogEntry,
        pending: &[Pending],
        in_flight: &mut HashMap<(u64, u64), usize>,
    ) -> Classified {
        let index = entry.log_id.index;
        match entry.payload {
            EntryPayload::Blank => Classified::Done(CommandResult::Empty),
            EntryPayload::Membership(membership) => {
                self.apply_membership(entry.log_id, membership);
                Classified::Done(CommandResult::Empty)
            }
            EntryPayload::Normal(Command::RegisterSession { client_id }) => {
                if !self.state.sessions.register(client_id) {
                    tracing::debug!(shard_id = self.shard_id, client_id, "session already registered");
                }
                Classified::Done(CommandResult::Registered)
            }
            EntryPayload::Normal(Command::UnregisterSession { client_id }) => {
                if self.state.sessions.unregister(client_id) {
                    Classified::Done(CommandResult::Unregistered)
                } else {
                    Classified::Done(CommandResult::SessionExpired)
                }
            }
            EntryPayload::Normal(Command::Propose { session, payload }) => {
                let entry = SmEntry { index, cmd: payload };
                if session.series_id == series::NOOP {
                    return Classified::Queued(entry, None);
                }
                let key = (session.client_id, session.series_id);
                if let Some(&origin) = in_flight.get(&key) {
                    return Classified::DuplicateOf(origin);
                }
                match self
                    .state
                    .sessions
                    .check(session.client_id, session.series_id, session.responded_to)
                {
                    SessionCheck::Expired => Classified::Done(CommandResult::SessionExpired),
                    SessionCheck::Cached(result) => Classified::Done(result),
                    SessionCheck::Responded => Classified::Done(CommandResult::Rejected(format!(
                        "series {} of client {} was already responded to",
                        session.series_id, session.client_id
                    ))),
                    SessionCheck::New => {
                        in_flight.insert(key, pending.len());
                        Classified::Queued(entry, Some(key))
                    }
                }
            }
        }
    }
}

enum Classified {
    Done(CommandResult),
    Queued(SmEntry, Option<(u64, u64)>),
    /// Same session and series as the pending payload at this position.
    DuplicateOf(usize),
}

fn io_error(e: &Error) -> StorageError<NodeId> {
    StorageIOError::write_state_machine(AnyError::new(e)).into()
}

impl RaftStateMachine<TypeConfig> for ReplicaStateMachine {
    type SnapshotBuilder = ReplicaSnapshotBuilder;

    async fn applied_state(
        &mut self,
    ) -> std::result::Result<(Option<LogId>, StoredMembership), StorageError<NodeId>> {
        Ok((self.state.last_applied, self.state.membership.clone()))
    }

    async fn apply<I>(&mut self, entries: I) -> std::result::Result<Vec<CommandResult>, StorageError<NodeId>>
    where
        I: IntoIterator<Item = LogEntry> + OptionalSend,
        I::IntoIter: OptionalSend,
    {
        let mut results = Vec::new();
        let mut pending: Vec<Pending> = Vec::new();
        let mut in_flight = HashMap::new();
        let mut duplicates = Vec::new();
        let removed_before = self.state.removed.len();

        for entry in entries {
            self.state.last_applied = Some(entry.log_id);
            let slot = results.len();
            match self.classify(entry, &pending, &mut in_flight) {
                Classified::Done(result) => results.push(result),
                Classified::Queued(entry, session) => {
                    pending.push(Pending { slot, entry, session });
                    results.push(CommandResult::Empty);
                }
                Classified::DuplicateOf(position) => {
                    duplicates.push((slot, position));
                    results.push(CommandResult::Empty);
                }
            }
        }

        if !pending.is_empty() {
            let applied = self.update_user(&pending).map_err(|e| io_error(&e))?;
            for (p, result) in pending.iter().zip(applied) {
                if let Some((client_id, series_id)) = p.session {
                    self.state.sessions.record(client_id, series_id, result.clone());
                }
                results[p.slot] = result;
            }
            for (slot, position) in duplicates {
                results[slot] = results[pending[position].slot].clone();
            }
        }

        if self.state.removed.len() != removed_before {
            *self.removed.write() = self.state.removed.clone();
        }
        self.persist().map_err(|e| io_error(&e))?;
        Ok(results)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        let index = self.state.last_applied.map(|l| l.index).unwrap_or(0);
        self.listener.on_event(RaftEvent::SnapshotStarted {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            index,
        });

        let context = self.user.read().prepare_snapshot();
        ReplicaSnapshotBuilder {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            user: self.user.clone(),
            context: Some(context),
            sessions: self.state.sessions.clone(),
            removed: self.state.removed.clone(),
            last_applied: self.state.last_applied,
            membership: self.state.membership.clone(),
            store: self.snapshots.clone(),
            listener: self.listener.clone(),
        }
    }

    async fn begin_receiving_snapshot(&mut self) -> std::result::Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> std::result::Result<(), StorageError<NodeId>> {
        let index = meta.last_log_id.map(|l| l.index).unwrap_or(0);
        self.listener.on_event(RaftEvent::SnapshotReceived {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            index,
        });

        let data = (*snapshot).into_inner();
        let read_error = |e: Error| -> StorageError<NodeId> {
            StorageIOError::read_snapshot(Some(meta.signature()), AnyError::new(&e)).into()
        };
        self.restore(meta, &data).map_err(read_error)?;
        self.persist().map_err(read_error)?;
        let previous = self.snapshots.save(meta, &data).map_err(read_error)?;

        tracing::info!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            index,
            snapshot_id = %meta.snapshot_id,
            "installed snapshot"
        );
        if let Some(previous) = previous {
            self.listener.on_event(RaftEvent::SnapshotCompacted {
                shard_id: self.shard_id,
                replica_id: self.replica_id,
                index: previous.last_log_id.map(|l| l.index).unwrap_or(0),
            });
        }
        self.listener.on_event(RaftEvent::SnapshotRecovered {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            index,
        });
        Ok(())
    }

    async fn get_current_snapshot(&mut self) -> std::result::Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        let current = self
            .snapshots
            .load()
            .map_err(|e| StorageError::from(StorageIOError::read_snapshot(None, AnyError::new(&e))))?;
        Ok(current.map(|(meta, data)| Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        }))
    }
}
