//! ML node service.
//!
//! Reads its configuration from the environment and node settings from a
//! TOML file, publishes its ML attributes and serves persistent tasks
//! until interrupted.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use mlnode_agent::config::Config;
use mlnode_agent::datafeed::EmptyExtractor;
use mlnode_agent::persistent::DEFAULT_CANCEL_TIMEOUT;
use mlnode_agent::storage::JsonLinesResultsWriter;
use mlnode_agent::{MlNode, NodeBootstrap};
use mlnode_capacity::SystemProbe;
use mlnode_templates::SqliteTemplateStore;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Time queued pool work gets to finish on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        node_id = %config.node_id,
        node_name = %config.node_name,
        data_dir = %config.data_dir.display(),
        "Starting ML node"
    );

    let settings = config.load_node_settings()?;

    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("failed to create data dir {}", config.data_dir.display()))?;
    let template_store = SqliteTemplateStore::open(config.template_store_path())
        .context("failed to open template store")?;

    let node = MlNode::start(NodeBootstrap {
        node_id: config.node_id,
        node_name: config.node_name.clone(),
        home: config.home.clone(),
        settings,
        probe: Arc::new(SystemProbe::new()),
        template_store: Arc::new(template_store),
        writer: Arc::new(JsonLinesResultsWriter::new(config.results_dir())),
        extractor: Arc::new(EmptyExtractor),
        template_check_interval: config.template_check_interval(),
        task_cancel_timeout: DEFAULT_CANCEL_TIMEOUT,
    })
    .await
    .context("ML node failed to start")?;

    info!(
        attributes = ?node.attributes().node_attributes(),
        eligibility = ?node.eligibility(),
        "ML node attributes published"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");

    node.shutdown(SHUTDOWN_GRACE).await;
    Ok(())
}
