use std::sync::Arc;

use berth_agent::{AgentConfig, DirStore, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cfg = AgentConfig::from_env();
    tokio::fs::create_dir_all(&cfg.data_root).await?;
    tracing::info!(data_root = %cfg.data_root.display(), "berth-agent starting");

    let store = Arc::new(DirStore::new(cfg.data_root.join("records")));
    let orchestrator = Orchestrator::new(cfg, store);

    orchestrator.recover_on_startup().await?;
    tracing::info!("startup recovery complete");

    // The transport layer attaches to the orchestrator here; until then the
    // agent runs headless and is driven through tests and the library API.
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    Ok(())
}
