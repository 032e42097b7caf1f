//! Snapshot building, framing and on-disk storage.

use std::collections::BTreeSet;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyerror::AnyError;
use openraft::storage::{RaftSnapshotBuilder, Snapshot};
use openraft::{StorageError, StorageIOError};
use serde::{Deserialize, Serialize};

use super::session::SessionRegistry;
use crate::error::{Error, Result};
use crate::events::{RaftEvent, RaftEventListener};
use crate::statemachine::{SharedStateMachine, SnapshotContext};
use crate::types::{LogId, NodeId, ReplicaId, ShardId, SnapshotMeta, StoredMembership, TypeConfig};

/// Current [`ReplicaSnapshot`] format version.
pub const SNAPSHOT_VERSION: u32 = 1;

const META_FILE: &str = "current.meta";
const DATA_FILE: &str = "current.snap";

/// Payload of a replica snapshot: the wrapper's replicated state plus the
/// user state machine's own image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSnapshot {
    pub version: u32,
    pub sessions: SessionRegistry,
    pub removed: BTreeSet<ReplicaId>,
    pub user_image: Vec<u8>,
}

impl ReplicaSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let snapshot: Self = serde_json::from_slice(bytes)?;
        if snapshot.version != SNAPSHOT_VERSION {
            return Err(Error::Serialization(format!(
                "snapshot version {} is not supported, expected {}",
                snapshot.version, SNAPSHOT_VERSION
            )));
        }
        Ok(snapshot)
    }
}

/// The latest snapshot of one replica, kept as `current.meta` and
/// `current.snap` in the replica's snapshot directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Replace the current snapshot, returning the metadata it replaced.
    ///
    /// Both files are written under temporary names and renamed, data
    /// first, so a crash never pairs new metadata with old data.
    pub fn save(&self, meta: &SnapshotMeta, data: &[u8]) -> Result<Option<SnapshotMeta>> {
        std::fs::create_dir_all(&self.dir)?;
        let previous = self.load_meta()?;

        let data_tmp = self.dir.join(format!("{DATA_FILE}.tmp"));
        let meta_tmp = self.dir.join(format!("{META_FILE}.tmp"));
        std::fs::write(&data_tmp, data)?;
        std::fs::write(&meta_tmp, serde_json::to_vec(meta)?)?;
        std::fs::rename(&data_tmp, self.dir.join(DATA_FILE))?;
        std::fs::rename(&meta_tmp, self.dir.join(META_FILE))?;

        tracing::info!(
            snapshot_id = %meta.snapshot_id,
            bytes = data.len(),
            dir = %self.dir.display(),
            "saved snapshot"
        );
        Ok(previous)
    }

    fn load_meta(&self) -> Result<Option<SnapshotMeta>> {
        let path = self.dir.join(META_FILE);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_slice(&std::fs::read(path)?)?))
    }

    /// The current snapshot, if one was ever saved.
    pub fn load(&self) -> Result<Option<(SnapshotMeta, Vec<u8>)>> {
        let Some(meta) = self.load_meta()? else {
            return Ok(None);
        };
        let data = std::fs::read(self.dir.join(DATA_FILE))?;
        Ok(Some((meta, data)))
    }
}

fn snapshot_id(shard_id: ShardId, replica_id: ReplicaId, last_applied: Option<LogId>) -> String {
    let index = last_applied.map(|l| l.index).unwrap_or(0);
    let millis = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or_default();
    format!("{shard_id}-{replica_id}-{index}-{millis}")
}

/// Builds a snapshot from state captured on the apply loop.
///
/// The user state machine's view and the wrapper state are captured when
/// the builder is created, so applying can continue while the image is
/// encoded and written.
pub struct ReplicaSnapshotBuilder {
    pub(crate) shard_id: ShardId,
    pub(crate) replica_id: ReplicaId,
    pub(crate) user: SharedStateMachine,
    /// Taken by the first build; holds the error if capturing failed.
    pub(crate) context: Option<Result<SnapshotContext>>,
    pub(crate) sessions: SessionRegistry,
    pub(crate) removed: BTreeSet<ReplicaId>,
    pub(crate) last_applied: Option<LogId>,
    pub(crate) membership: StoredMembership,
    pub(crate) store: SnapshotStore,
    pub(crate) listener: Arc<dyn RaftEventListener>,
}

impl ReplicaSnapshotBuilder {
    fn encode(&mut self) -> Result<Vec<u8>> {
        let context = self
            .context
            .take()
            .ok_or_else(|| Error::Internal("snapshot builder used twice".into()))??;
        let mut user_image = Vec::new();
        self.user.read().save_snapshot(context, &mut user_image)?;

        ReplicaSnapshot {
            version: SNAPSHOT_VERSION,
            sessions: std::mem::take(&mut self.sessions),
            removed: std::mem::take(&mut self.removed),
            user_image,
        }
        .to_bytes()
    }
}

impl RaftSnapshotBuilder<TypeConfig> for ReplicaSnapshotBuilder {
    async fn build_snapshot(&mut self) -> std::result::Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.membership.clone(),
            snapshot_id: snapshot_id(self.shard_id, self.replica_id, self.last_applied),
        };
        let signature = Some(meta.signature());

        let data = self
            .encode()
            .map_err(|e| StorageIOError::write_snapshot(signature.clone(), AnyError::new(&e)))?;
        let previous = self
            .store
            .save(&meta, &data)
            .map_err(|e| StorageIOError::write_snapshot(signature, AnyError::new(&e)))?;

        let index = self.last_applied.map(|l| l.index).unwrap_or(0);
        self.listener.on_event(RaftEvent::SnapshotCreated {
            shard_id: self.shard_id,
            replica_id: self.replica_id,
            index,
        });
        if let Some(previous) = previous {
            self.listener.on_event(RaftEvent::SnapshotCompacted {
                shard_id: self.shard_id,
                replica_id: self.replica_id,
                index: previous.last_log_id.map(|l| l.index).unwrap_or(0),
            });
        }

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}
