//! On-disk key/value state machine.

use std::io::{Read, Write};
use std::path::PathBuf;

use quorumkv_proto::{KvRequest, RequestKind};
use quorumkv_store::{KvEngine, StoreConfig, StoreImage};

use super::{SmEntry, SmResult, SnapshotContext, StateMachine};
use crate::error::{Error, Result};
use crate::types::{ReplicaId, ShardId};

/// Lifecycle of the backing store handle.
enum Lifecycle {
    Unopened,
    Open(KvEngine),
    Closed,
}

/// Applies [`KvRequest`] envelopes to a [`KvEngine`] owned by one replica.
///
/// Calling anything but `open` before the store is open, or anything at
/// all after `close`, is a programming error and panics.
pub struct KvStateMachine {
    shard_id: ShardId,
    replica_id: ReplicaId,
    dir: PathBuf,
    cache_capacity: u64,
    state: Lifecycle,
}

impl KvStateMachine {
    pub fn new(shard_id: ShardId, replica_id: ReplicaId, dir: impl Into<PathBuf>) -> Self {
        Self {
            shard_id,
            replica_id,
            dir: dir.into(),
            cache_capacity: StoreConfig::default().cache_capacity,
            state: Lifecycle::Unopened,
        }
    }

    pub fn with_cache_capacity(mut self, bytes: u64) -> Self {
        self.cache_capacity = bytes;
        self
    }

    fn store_config(&self) -> StoreConfig {
        StoreConfig::new(&self.dir).with_cache_capacity(self.cache_capacity)
    }

    fn engine(&self, op: &str) -> &KvEngine {
        match &self.state {
            Lifecycle::Open(engine) => engine,
            Lifecycle::Unopened => panic!("precondition violated: {op} on a state machine that was never opened"),
            Lifecycle::Closed => panic!("precondition violated: {op} on a closed state machine"),
        }
    }

    fn decode_batch(entries: &[SmEntry]) -> Result<Vec<KvRequest>> {
        entries
            .iter()
            .map(|entry| -> Result<KvRequest> {
                let request = KvRequest::decode(&entry.cmd).map_err(|e| {
                    Error::UnsupportedMethod(format!("entry {} is not a valid request: {e}", entry.index))
                })?;
                if request.kind == RequestKind::GetKey {
                    return Err(Error::UnsupportedMethod(format!(
                        "entry {} carries GetKey, which is served by lookup",
                        entry.index
                    )));
                }
                Ok(request)
            })
            .collect()
    }
}

impl StateMachine for KvStateMachine {
    fn open(&mut self) -> Result<u64> {
        if !matches!(self.state, Lifecycle::Unopened) {
            panic!("precondition violated: state machine opened twice");
        }
        let engine = KvEngine::open(self.store_config())?;
        let index = engine.get_monotonic_log_index()?;
        tracing::info!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            index,
            recovered = engine.was_recovered(),
            "opened key/value state machine"
        );
        self.state = Lifecycle::Open(engine);
        Ok(index)
    }

    fn update(&mut self, entries: &[SmEntry]) -> Result<Vec<SmResult>> {
        let engine = self.engine("update");
        let requests = Self::decode_batch(entries)?;
        let applied = engine.get_monotonic_log_index()?;

        let mut results = Vec::with_capacity(entries.len());
        for (entry, request) in entries.iter().zip(&requests) {
            // Already applied before a restart.
            if entry.index <= applied {
                results.push(SmResult::default());
                continue;
            }
            let reply = engine.apply(entry.index, request)?;
            results.push(SmResult {
                value: u64::from(!reply.is_error()),
                data: reply.to_bytes()?,
            });
        }
        Ok(results)
    }

    fn lookup(&self, query: &[u8]) -> Result<Vec<u8>> {
        let engine = self.engine("lookup");
        let request = KvRequest::decode(query)?;
        match engine.lookup(&request) {
            Ok(reply) => Ok(reply.to_bytes()?),
            Err(quorumkv_store::Error::UnsupportedMethod(msg)) => Err(Error::UnsupportedMethod(msg)),
            Err(e) => Err(e.into()),
        }
    }

    fn sync(&self) -> Result<()> {
        self.engine("sync").flush()?;
        Ok(())
    }

    fn prepare_snapshot(&self) -> Result<SnapshotContext> {
        let image = self.engine("prepare_snapshot").snapshot()?;
        Ok(Box::new(image))
    }

    fn save_snapshot(&self, ctx: SnapshotContext, writer: &mut dyn Write) -> Result<()> {
        let image = ctx
            .downcast::<StoreImage>()
            .map_err(|_| Error::Internal("snapshot context is not a store image".into()))?;
        writer.write_all(&image.to_bytes()?)?;
        Ok(())
    }

    fn recover_from_snapshot(&mut self, reader: &mut dyn Read) -> Result<()> {
        self.engine("recover_from_snapshot");
        let mut bytes = Vec::new();
        reader.read_to_end(&mut bytes)?;
        let image = StoreImage::from_bytes(&bytes)?;

        // The old handle must be gone before its directory is removed.
        self.state = Lifecycle::Unopened;
        if self.dir.exists() {
            std::fs::remove_dir_all(&self.dir)?;
        }
        let engine = KvEngine::open(self.store_config())?;
        engine.restore(&image)?;
        tracing::info!(
            shard_id = self.shard_id,
            replica_id = self.replica_id,
            index = image.index,
            entries = image.len(),
            "recovered key/value state machine from snapshot"
        );
        self.state = Lifecycle::Open(engine);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.state, Lifecycle::Closed) {
            Lifecycle::Open(engine) => {
                engine.flush()?;
                Ok(())
            }
            Lifecycle::Unopened => panic!("precondition violated: close on a state machine that was never opened"),
            Lifecycle::Closed => panic!("precondition violated: close on a closed state machine"),
        }
    }

    fn is_on_disk(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use quorumkv_proto::{error_codes, KeyValue, KvResponse, ReplyPayload};

    use super::*;

    fn entry(index: u64, request: &KvRequest) -> SmEntry {
        SmEntry {
            index,
            cmd: request.to_bytes().unwrap(),
        }
    }

    fn open(dir: &std::path::Path) -> KvStateMachine {
        let mut sm = KvStateMachine::new(1_000, 1, dir.join("kv"));
        sm.open().unwrap();
        sm
    }

    #[test]
    fn test_update_returns_one_reply_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());

        let results = sm
            .update(&[
                entry(1, &KvRequest::create_account(42, "a@b.com")),
                entry(2, &KvRequest::create_bucket(42, "logs", "a@b.com")),
                entry(3, &KvRequest::create_bucket(42, "logs", "a@b.com")),
            ])
            .unwrap();

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].value, 1);
        let dup = KvResponse::from_bytes(&results[2].data).unwrap();
        assert_eq!(dup.error_code(), Some(error_codes::BUCKET_EXISTS));
        assert_eq!(results[2].value, 0);
    }

    #[test]
    fn test_get_key_fails_whole_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());

        let result = sm.update(&[
            entry(1, &KvRequest::create_account(42, "a@b.com")),
            entry(2, &KvRequest::get_key(42, "logs", "k")),
        ]);
        assert!(matches!(result, Err(Error::UnsupportedMethod(_))));

        // Nothing from the batch was applied.
        let query = KvRequest::get_key(42, "logs", "k").to_bytes().unwrap();
        let reply = KvResponse::from_bytes(&sm.lookup(&query).unwrap()).unwrap();
        assert_eq!(reply.error_code(), Some(error_codes::MISSING_BUCKET));
    }

    #[test]
    fn test_lookup_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let sm = open(dir.path());
        let query = KvRequest::create_account(42, "a@b.com").to_bytes().unwrap();
        assert!(matches!(sm.lookup(&query), Err(Error::UnsupportedMethod(_))));
    }

    #[test]
    fn test_replayed_entries_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());
        let put = KvRequest::put_key(42, "logs", KeyValue::new("k", b"v".to_vec(), 1));
        sm.update(&[
            entry(1, &KvRequest::create_account(42, "a@b.com")),
            entry(2, &KvRequest::create_bucket(42, "logs", "a@b.com")),
            entry(3, &put),
        ])
        .unwrap();

        // Redelivering index 3 must not turn into a version conflict.
        let results = sm.update(&[entry(3, &put)]).unwrap();
        assert_eq!(results[0], SmResult::default());

        let query = KvRequest::get_key(42, "logs", "k").to_bytes().unwrap();
        let reply = KvResponse::from_bytes(&sm.lookup(&query).unwrap()).unwrap();
        assert!(matches!(reply.payload, ReplyPayload::Key(ref kv) if kv.version == 1));
    }

    fn image_of(sm: &KvStateMachine) -> StoreImage {
        *sm.prepare_snapshot().unwrap().downcast::<StoreImage>().unwrap()
    }

    fn key_reply(sm: &KvStateMachine, account_id: u64, bucket: &str, key: &str) -> KvResponse {
        let query = KvRequest::get_key(account_id, bucket, key).to_bytes().unwrap();
        KvResponse::from_bytes(&sm.lookup(&query).unwrap()).unwrap()
    }

    #[test]
    fn test_snapshot_replaces_populated_replica() {
        let source_dir = tempfile::tempdir().unwrap();
        let mut source = open(source_dir.path());
        source
            .update(&[
                entry(1, &KvRequest::create_account(42, "a@b.com").with_timestamp(100)),
                entry(2, &KvRequest::create_bucket(42, "logs", "a@b.com").with_timestamp(101)),
                entry(3, &KvRequest::create_bucket(42, "metrics", "a@b.com").with_timestamp(102)),
                entry(
                    4,
                    &KvRequest::put_key(42, "logs", KeyValue::new("k1", b"v1".to_vec(), 1)).with_timestamp(103),
                ),
                entry(
                    5,
                    &KvRequest::put_key(42, "metrics", KeyValue::new("k2", b"v2".to_vec(), 1)).with_timestamp(104),
                ),
            ])
            .unwrap();

        let mut stream = Vec::new();
        source
            .save_snapshot(source.prepare_snapshot().unwrap(), &mut stream)
            .unwrap();

        let target_dir = tempfile::tempdir().unwrap();
        let mut target = open(target_dir.path());
        target
            .update(&[
                entry(1, &KvRequest::create_account(7, "stale@b.com")),
                entry(2, &KvRequest::create_bucket(7, "old", "stale@b.com")),
                entry(3, &KvRequest::put_key(7, "old", KeyValue::new("gone", b"x".to_vec(), 1))),
                entry(4, &KvRequest::create_account(42, "other@b.com")),
            ])
            .unwrap();

        target.recover_from_snapshot(&mut stream.as_slice()).unwrap();

        let expected = image_of(&source);
        assert_eq!(expected.index, 5);
        assert_eq!(image_of(&target), expected);
        assert!(matches!(
            key_reply(&target, 42, "metrics", "k2").payload,
            ReplyPayload::Key(ref kv) if kv.value == b"v2".to_vec()
        ));
        assert_eq!(
            key_reply(&target, 7, "old", "gone").error_code(),
            Some(error_codes::MISSING_BUCKET)
        );
        target.close().unwrap();

        let mut reopened = KvStateMachine::new(1_000, 1, target_dir.path().join("kv"));
        assert_eq!(reopened.open().unwrap(), 5);
        reopened.close().unwrap();

        let engine = KvEngine::open(StoreConfig::new(target_dir.path().join("kv"))).unwrap();
        assert!(engine.get_account(7).unwrap().is_none());
        assert!(engine.get_bucket(7, "old").unwrap().is_none());
        let account = engine.get_account(42).unwrap().unwrap();
        assert_eq!(account.owner, "a@b.com");
        assert_eq!(account.buckets, vec!["logs".to_string(), "metrics".to_string()]);
        assert_eq!(engine.get_bucket(42, "logs").unwrap().unwrap().key_count, 1);
        assert_eq!(engine.get_key(42, "logs", b"k1").unwrap().value, b"v1".to_vec());
    }

    #[test]
    #[should_panic(expected = "precondition violated")]
    fn test_close_without_open_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = KvStateMachine::new(1_000, 1, dir.path().join("kv"));
        let _ = sm.close();
    }

    #[test]
    #[should_panic(expected = "precondition violated")]
    fn test_update_after_close_panics() {
        let dir = tempfile::tempdir().unwrap();
        let mut sm = open(dir.path());
        sm.close().unwrap();
        let _ = sm.update(&[]);
    }
}
