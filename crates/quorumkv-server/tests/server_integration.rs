use quorumkv_raft::NodeFactory;
use quorumkv_server::ServerConfig;

fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr.to_string()
}

fn config(dir: &std::path::Path, addr: &str) -> ServerConfig {
    let mut config = ServerConfig::new(dir).with_bootstrap_shard(1_000).with_replica_id(3);
    config.node.host = config
        .node
        .host
        .with_raft_addr(addr)
        .with_heartbeat_interval_ms(50)
        .with_election_timeout_ms(150, 300);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bootstrap_is_skipped_once_the_shard_is_hosted() {
    let dir = tempfile::tempdir().unwrap();
    let addr = free_addr();
    let factory = NodeFactory::new();

    let node = quorumkv_server::start(&factory, &config(dir.path(), &addr)).await.unwrap();
    let local = node.host().local_replica(1_000).unwrap();
    assert_eq!(local.replica_id, 3);
    drop(node);
    factory.shutdown(dir.path()).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;

    // Restart: the lifecycle manager brings the replica back and the
    // bootstrap request is a no-op.
    let node = quorumkv_server::start(&factory, &config(dir.path(), &addr)).await.unwrap();
    assert!(node.host().has_replica(1_000, 3));
    drop(node);
    factory.shutdown(dir.path()).await.unwrap();
}

#[tokio::test]
async fn plugin_shards_cannot_be_bootstrapped() {
    let dir = tempfile::tempdir().unwrap();
    let config = ServerConfig::new(dir.path()).with_bootstrap_shard(2_000_000_000);
    let err = quorumkv_server::start(&NodeFactory::new(), &config).await.err().unwrap();
    assert!(matches!(err, quorumkv_server::Error::Config(_)));
}
