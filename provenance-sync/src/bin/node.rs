//! Provenance node binary
//!
//! Opens the ledger, replays interrupted operations, then runs the sync loop
//! and webhook workers until Ctrl-C.

use anyhow::Context;
use provenance_ledger::{LedgerManager, MemoryStore};
use provenance_sync::{Config, SyncNode};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let filter = EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into());
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    info!("Starting provenance node");

    // Load configuration
    let ledger_config = provenance_ledger::Config::from_env().context("ledger configuration")?;
    let config = if let Ok(path) = std::env::var("SYNC_CONFIG") {
        info!("Loading sync config from: {}", path);
        Config::from_file(&path).context("sync configuration file")?
    } else {
        Config::from_env().context("sync configuration")?
    };

    // The relational store client is provided by the deployment; the
    // in-process store keeps the node self-contained.
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(
        LedgerManager::open(ledger_config, store)
            .await
            .context("opening ledger")?,
    );

    let summary = manager.reconcile().await;
    if summary.replayed + summary.failed > 0 {
        info!(
            replayed = summary.replayed,
            failed = summary.failed,
            "Replayed interrupted operations"
        );
    }
    let report = manager.consistency_check().await;
    if !report.is_consistent() {
        warn!(
            error = report.error.as_deref().unwrap_or_default(),
            recommendation = report.recommendation.as_deref().unwrap_or_default(),
            "Ledger is inconsistent"
        );
    }

    let node = SyncNode::new(config, manager.clone()).context("starting sync node")?;
    node.engine.start()?;

    info!("Provenance node running");

    // Wait for shutdown signal
    signal::ctrl_c().await?;
    info!("Shutting down provenance node");

    node.shutdown().await;
    manager.shutdown().await?;
    Ok(())
}
