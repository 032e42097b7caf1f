//! End-to-end behaviour of a single-host node.

use std::sync::Arc;
use std::time::Duration;

use quorumkv_proto::{error_codes, KeyValue};
use quorumkv_raft::{Error, HostConfig, Node, NodeConfig, NodeFactory, StateMachineType};

const TIMEOUT: Duration = Duration::from_secs(5);

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn config(dir: &std::path::Path, addr: &str) -> NodeConfig {
    let host = HostConfig::new(dir)
        .with_raft_addr(addr)
        .with_heartbeat_interval_ms(50)
        .with_election_timeout_ms(150, 300);
    NodeConfig::new(host).with_request_timeout_ms(5_000)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn account_bucket_key_walkthrough() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::start(config(dir.path(), &free_addr())).await.unwrap();
    node.shards()
        .new_shard(1_000, 1, StateMachineType::OnDiskKv, TIMEOUT)
        .await
        .unwrap();

    let txns = node.transactions();
    let kv = node.kv();
    let txn = txns.get_transaction(1_000, TIMEOUT).await.unwrap();

    let account = kv.create_account(&txn, 42, "a@b.com").await.unwrap();
    assert_eq!(account.account_id, 42);
    let txn = txns.commit(&txn).unwrap();

    kv.create_bucket(&txn, 42, "logs", "a@b.com").await.unwrap();
    let txn = txns.commit(&txn).unwrap();
    let err = kv.create_bucket(&txn, 42, "logs", "a@b.com").await.unwrap_err();
    assert_eq!(err.kv_code(), Some(error_codes::BUCKET_EXISTS));
    let txn = txns.commit(&txn).unwrap();

    let stored = kv
        .put_key(&txn, 42, "logs", KeyValue::new("k", b"v1".to_vec(), 1))
        .await
        .unwrap();
    assert_eq!(stored.version, 1);
    assert!(stored.mod_revision > 0);
    assert_eq!(stored.create_revision, stored.mod_revision);
    let txn = txns.commit(&txn).unwrap();

    let err = kv
        .put_key(&txn, 42, "logs", KeyValue::new("k", b"v1'".to_vec(), 1))
        .await
        .unwrap_err();
    assert_eq!(err.kv_code(), Some(error_codes::VERSION_CONFLICT));
    let txn = txns.commit(&txn).unwrap();

    let read = kv.get_key(1_000, 42, "logs", b"k").await.unwrap();
    assert_eq!(read.value, b"v1");

    kv.delete_key(&txn, 42, "logs", b"k").await.unwrap();
    let err = kv.get_key(1_000, 42, "logs", b"k").await.unwrap_err();
    assert_eq!(err.kv_code(), Some(error_codes::KEY_NOT_FOUND));
    let err = kv.get_key(1_000, 42, "missing", b"k").await.unwrap_err();
    assert_eq!(err.kv_code(), Some(error_codes::MISSING_BUCKET));

    let txn = txns.commit(&txn).unwrap();
    txns.close_transaction(&txn, TIMEOUT).await.unwrap();
    assert!(txns.is_empty());

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn retried_proposal_is_applied_once() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::start(config(dir.path(), &free_addr())).await.unwrap();
    node.shards()
        .new_shard(1_001, 1, StateMachineType::OnDiskKv, TIMEOUT)
        .await
        .unwrap();
    let txns = node.transactions();
    let kv = node.kv();

    let setup = txns.get_noop_transaction(1_001);
    kv.create_account(&setup, 7, "owner").await.unwrap();
    kv.create_bucket(&setup, 7, "b", "owner").await.unwrap();

    let first = txns.get_transaction(1_001, TIMEOUT).await.unwrap();
    let stored = kv
        .put_key(&first, 7, "b", KeyValue::new("k", b"once".to_vec(), 1))
        .await
        .unwrap();
    // Same transaction again: the cached reply comes back instead of a
    // version conflict.
    let retried = kv
        .put_key(&first, 7, "b", KeyValue::new("k", b"once".to_vec(), 1))
        .await
        .unwrap();
    assert_eq!(retried, stored);

    let second = txns.commit(&first).unwrap();
    kv.put_key(&second, 7, "b", KeyValue::new("k", b"twice".to_vec(), 2))
        .await
        .unwrap();

    // The first proposal is now acknowledged as responded to.
    let err = kv
        .put_key(&first, 7, "b", KeyValue::new("k", b"once".to_vec(), 1))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "unexpected {err:?}");
    assert_eq!(kv.get_key(1_001, 7, "b", b"k").await.unwrap().version, 2);

    txns.close_transaction(&second, TIMEOUT).await.unwrap();
    let err = kv
        .put_key(&second, 7, "b", KeyValue::new("k", b"late".to_vec(), 3))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::SessionNotFound(_)));

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stale_config_change_id_is_fenced() {
    let dir = tempfile::tempdir().unwrap();
    let node = Node::start(config(dir.path(), &free_addr())).await.unwrap();
    let shards = node.shards();
    let created = shards
        .new_shard(1_002, 1, StateMachineType::InMemory, TIMEOUT)
        .await
        .unwrap();
    let stale = created.config_change_id;

    shards
        .add_replica_observer(1_002, 5, "127.0.0.1:1", TIMEOUT)
        .await
        .unwrap();
    let err = node
        .host()
        .request_add_observer(1_002, 6, "127.0.0.1:2", stale, TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "unexpected {err:?}");

    let members = shards.get_shard_members(1_002, TIMEOUT).await.unwrap();
    assert!(members.config_change_id > stale);
    assert!(members.observers.contains_key(&5));
    assert!(!members.observers.contains_key(&6));

    shards.remove_replica(1_002, 5, TIMEOUT).await.unwrap();
    let err = shards
        .add_replica_observer(1_002, 5, "127.0.0.1:1", TIMEOUT)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Rejected(_)), "unexpected {err:?}");
    let recorded = shards.store().get(1_002).unwrap().unwrap();
    assert!(recorded.members.removed.contains(&5));

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restarted_node_rejoins_hosted_shards() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();

    {
        let node = Node::start(config(dir.path(), &addr)).await.unwrap();
        node.shards()
            .new_shard(1_003, 1, StateMachineType::OnDiskKv, TIMEOUT)
            .await
            .unwrap();
        let txn = node.transactions().get_noop_transaction(1_003);
        node.kv().create_account(&txn, 9, "owner").await.unwrap();
        node.kv().create_bucket(&txn, 9, "b", "owner").await.unwrap();
        node.kv()
            .put_key(&txn, 9, "b", KeyValue::new("k", b"durable".to_vec(), 1))
            .await
            .unwrap();
        node.shutdown().await.unwrap();
    }
    // Let detached callback tasks release the shard-state store.
    tokio::time::sleep(Duration::from_millis(200)).await;

    let node = Node::start(config(dir.path(), &addr)).await.unwrap();
    assert!(node.host().has_replica(1_003, 1));
    node.shards().get_shard_members(1_003, TIMEOUT).await.unwrap();
    let kv = node.kv().get_key(1_003, 9, "b", b"k").await.unwrap();
    assert_eq!(kv.value, b"durable");

    node.shutdown().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn factory_starts_one_node_per_directory() {
    let dir = tempfile::tempdir().unwrap();
    let factory = NodeFactory::new();
    let config = config(dir.path(), &free_addr());

    let first = factory.get_or_start(config.clone()).await.unwrap();
    let second = factory.get_or_start(config).await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    assert!(factory.shutdown(dir.path()).await.unwrap());
    assert!(!factory.shutdown(dir.path()).await.unwrap());
}
