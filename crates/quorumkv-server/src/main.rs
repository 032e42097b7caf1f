//! quorumkv server - runs one node until interrupted.

#[cfg(feature = "mimalloc")]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quorumkv_raft::NodeFactory;
use quorumkv_server::Args;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "quorumkv_server=info,quorumkv_raft=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "starting quorumkv server");

    let config = Args::parse().into_config()?;
    tracing::info!(
        data_dir = %config.node.host.data_dir.display(),
        raft_addr = %config.node.host.raft_listen_addr,
        advertise_addr = %config.node.host.raft_advertise_addr,
        bootstrap_shards = ?config.bootstrap_shards,
        "configuration loaded"
    );

    let factory = NodeFactory::new();
    let node = quorumkv_server::start(&factory, &config).await?;
    tracing::info!(shards = node.host().hosted().len(), "server ready");

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl+c");
    }
    tracing::info!("received shutdown signal");

    factory.shutdown(&config.node.host.data_dir).await?;
    tracing::info!("server shutdown complete");
    Ok(())
}
