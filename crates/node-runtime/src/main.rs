//! Node entry point: an in-memory development node with mock connectors.

use std::sync::Arc;

use node_runtime::{NodeConfig, Orchestrator};
use shared_connectors::{
    MockBlockchainConnector, MockDataExchangeConnector, MockTokenConnector,
};
use shared_store::MemoryStore;
use tracing::info;
use wm_03_batch::MockBatchUploader;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mut orchestrator = Orchestrator::new(
        NodeConfig::default(),
        MemoryStore::new_arc(),
        Arc::new(MockBlockchainConnector::new()),
        Arc::new(MockDataExchangeConnector::new()),
        Arc::new(MockTokenConnector::new()),
        Arc::new(MockBatchUploader::new()),
    );
    orchestrator.start().await?;

    info!("Node running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    orchestrator.stop().await;
    Ok(())
}
