//! End-to-end behaviour of the storage engine.

use std::collections::BTreeSet;

use quorumkv_proto::{error_codes, KeyValue, KvRequest, ReplyPayload};
use quorumkv_store::{Error, KvEngine, StoreConfig};

fn open(dir: &std::path::Path) -> KvEngine {
    KvEngine::open(StoreConfig::new(dir)).unwrap()
}

#[test]
fn account_bucket_key_walkthrough() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());

    let account = engine.create_account_bucket(42, "a@b.com").unwrap();
    assert_eq!(account.bucket_count, 0);
    assert!(account.buckets.is_empty());

    engine.create_bucket(42, "logs", "a@b.com").unwrap();
    let account = engine.get_account(42).unwrap().unwrap();
    assert_eq!(account.buckets, vec!["logs".to_string()]);
    assert_eq!(account.bucket_count, 1);

    engine
        .put_key(42, "logs", &KeyValue::new("k", b"payload".to_vec(), 1))
        .unwrap();
    let conflict = engine.put_key(42, "logs", &KeyValue::new("k", b"other".to_vec(), 1));
    assert!(matches!(conflict, Err(Error::VersionConflict { current: 1, proposed: 1 })));

    engine.delete_bucket(42, "logs").unwrap();
    let account = engine.get_account(42).unwrap().unwrap();
    assert!(account.buckets.is_empty());
    assert_eq!(account.bucket_count, 0);
}

#[test]
fn cas_versions_advance_by_exactly_one() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());
    engine.create_account_bucket(1, "owner").unwrap();
    engine.create_bucket(1, "b", "owner").unwrap();

    assert!(matches!(
        engine.put_key(1, "b", &KeyValue::new("k", b"v0".to_vec(), 2)),
        Err(Error::VersionConflict { current: 0, .. })
    ));

    let mut last = 0;
    for version in 1..=5u64 {
        let stored = engine
            .put_key(1, "b", &KeyValue::new("k", format!("v{version}").into_bytes(), version))
            .unwrap();
        assert!(stored.version > last);
        last = stored.version;

        for bad in [0, version, version + 2] {
            let result = engine.put_key(1, "b", &KeyValue::new("k", b"bad".to_vec(), bad));
            assert!(matches!(result, Err(Error::VersionConflict { .. })));
        }
        let current = engine.get_key(1, "b", b"k").unwrap();
        assert_eq!(current.version, version);
        assert_eq!(current.value, format!("v{version}").into_bytes());
    }
}

#[test]
fn bucket_list_matches_existing_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let engine = open(dir.path());
    engine.create_account_bucket(9, "owner").unwrap();

    let names = ["a", "b", "c", "d", "e", "f"];
    let mut live = BTreeSet::new();
    let steps: [(bool, usize); 12] = [
        (true, 0),
        (true, 1),
        (true, 2),
        (true, 3),
        (true, 4),
        (false, 2),
        (true, 5),
        (false, 0),
        (true, 2),
        (false, 4),
        (false, 5),
        (true, 0),
    ];

    for (create, i) in steps {
        let name = names[i];
        if create {
            engine.create_bucket(9, name, "owner").unwrap();
            live.insert(name.to_string());
        } else {
            engine.delete_bucket(9, name).unwrap();
            live.remove(name);
        }

        let account = engine.get_account(9).unwrap().unwrap();
        let listed: BTreeSet<String> = account.buckets.iter().cloned().collect();
        assert_eq!(listed.len(), account.buckets.len(), "duplicate bucket names");
        assert_eq!(listed, live);
        assert_eq!(account.bucket_count as usize, account.buckets.len());
        for name in &live {
            assert!(engine.get_bucket(9, name).unwrap().is_some());
        }
    }
}

#[test]
fn reopen_keeps_data_and_index() {
    let dir = tempfile::tempdir().unwrap();
    {
        let engine = open(dir.path());
        engine.apply(1, &KvRequest::create_account(42, "a@b.com")).unwrap();
        engine.apply(2, &KvRequest::create_bucket(42, "logs", "a@b.com")).unwrap();
        engine
            .apply(3, &KvRequest::put_key(42, "logs", KeyValue::new("k", b"v".to_vec(), 1)))
            .unwrap();
        engine.flush().unwrap();
    }

    let engine = open(dir.path());
    assert_eq!(engine.get_monotonic_log_index().unwrap(), 3);
    assert_eq!(engine.get_key(42, "logs", b"k").unwrap().value, b"v".to_vec());
}

#[test]
fn apply_and_lookup_share_envelope_shape() {
    let engine = KvEngine::open(StoreConfig::temporary()).unwrap();
    engine.apply(1, &KvRequest::create_account(42, "a@b.com")).unwrap();
    engine.apply(2, &KvRequest::create_bucket(42, "logs", "a@b.com")).unwrap();

    let put = engine
        .apply(3, &KvRequest::put_key(42, "logs", KeyValue::new("k", b"v".to_vec(), 1)))
        .unwrap();
    assert!(matches!(put.payload, ReplyPayload::Key(ref kv) if kv.version == 1));

    let replay = engine
        .apply(4, &KvRequest::put_key(42, "logs", KeyValue::new("k", b"v".to_vec(), 1)))
        .unwrap();
    assert_eq!(replay.error_code(), Some(error_codes::VERSION_CONFLICT));

    let read = engine.lookup(&KvRequest::get_key(42, "logs", "k")).unwrap();
    assert!(matches!(read.payload, ReplyPayload::Key(ref kv) if kv.value == b"v".to_vec()));

    let missing = engine.lookup(&KvRequest::get_key(42, "logs", "nope")).unwrap();
    assert_eq!(missing.error_code(), Some(error_codes::KEY_NOT_FOUND));
}
