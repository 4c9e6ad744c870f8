//! Wiring of the sync components around one Ledger Manager

use crate::anchor::Anchor;
use crate::dlq::DeadLetterQueue;
use crate::engine::{SyncEngine, SyncState};
use crate::metrics::SyncMetrics;
use crate::snapshot::SnapshotStore;
use crate::tracker::IdempotencyTracker;
use crate::webhook::{EventProcessor, WebhookIngest};
use crate::{Config, Error, Result};
use provenance_ledger::LedgerManager;
use std::sync::Arc;
use tracing::{info, warn};

/// Sync engine, webhook ingest and their shared state
#[derive(Debug)]
pub struct SyncNode {
    /// Ledger Manager
    pub manager: Arc<LedgerManager>,
    /// Periodic sync
    pub engine: SyncEngine,
    /// Webhook worker pool
    pub webhook: WebhookIngest,
    /// Processed-hash registry
    pub tracker: Arc<IdempotencyTracker>,
    /// Dead letters
    pub dlq: Arc<DeadLetterQueue>,
    /// Record snapshots
    pub snapshots: SnapshotStore,
    /// Shared last-sync state
    pub state: Arc<SyncState>,
    /// Metrics
    pub metrics: SyncMetrics,
}

impl SyncNode {
    /// Build every component and spawn the webhook workers
    ///
    /// The sync loop is not started; call `engine.start()`.
    pub fn new(config: Config, manager: Arc<LedgerManager>) -> Result<Self> {
        std::fs::create_dir_all(&config.data_dir)?;

        let metrics = SyncMetrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;
        let tracker = Arc::new(IdempotencyTracker::open(&config)?);
        let snapshots = SnapshotStore::open(&config)?;
        let dlq = Arc::new(DeadLetterQueue::open(&config));
        let state = Arc::new(SyncState::new());
        let anchor = Arc::new(Anchor::new(manager.clone(), metrics.clone()));

        let processor = Arc::new(EventProcessor::new(
            anchor.clone(),
            tracker.clone(),
            snapshots.clone(),
            state.clone(),
        ));
        let webhook = WebhookIngest::start(&config, processor, dlq.clone(), metrics.clone());
        let engine = SyncEngine::new(
            config.clone(),
            anchor,
            tracker.clone(),
            state.clone(),
            metrics.clone(),
        )?;

        info!(
            service = %config.service_name,
            data_dir = %config.data_dir.display(),
            "Sync node ready"
        );

        Ok(Self {
            manager,
            engine,
            webhook,
            tracker,
            dlq,
            snapshots,
            state,
            metrics,
        })
    }

    /// Stop the sync loop if running and drain the webhook queue
    pub async fn shutdown(&self) {
        match self.engine.stop().await {
            Ok(()) | Err(Error::NotRunning) => {}
            Err(e) => warn!("Failed to stop sync engine: {}", e),
        }
        self.webhook.shutdown().await;
    }
}
