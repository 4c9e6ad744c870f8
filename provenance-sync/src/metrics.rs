//! Prometheus metrics for sync and webhook ingest
//!
//! - `sync_cycles_total` - Sync cycles by table and outcome
//! - `sync_records_anchored_total` - Chain transactions created for store rows
//! - `webhook_events_total` - Webhook events by outcome

use prometheus::{IntCounter, IntCounterVec, Opts, Registry};
use std::sync::Arc;

/// Sync metrics collector
#[derive(Clone)]
pub struct SyncMetrics {
    /// Cycles by `table` and `outcome`
    pub cycles_total: IntCounterVec,

    /// Rows anchored on the chain
    pub records_anchored_total: IntCounter,

    /// Webhook events by `outcome`
    pub webhook_events_total: IntCounterVec,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl SyncMetrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let cycles_total = IntCounterVec::new(
            Opts::new("sync_cycles_total", "Sync cycles"),
            &["table", "outcome"],
        )?;
        registry.register(Box::new(cycles_total.clone()))?;

        let records_anchored_total = IntCounter::new(
            "sync_records_anchored_total",
            "Chain transactions created for store rows",
        )?;
        registry.register(Box::new(records_anchored_total.clone()))?;

        let webhook_events_total = IntCounterVec::new(
            Opts::new("webhook_events_total", "Webhook events"),
            &["outcome"],
        )?;
        registry.register(Box::new(webhook_events_total.clone()))?;

        Ok(Self {
            cycles_total,
            records_anchored_total,
            webhook_events_total,
            registry,
        })
    }

    /// Record one table cycle
    pub fn record_cycle(&self, table: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.cycles_total.with_label_values(&[table, outcome]).inc();
    }

    /// Record a webhook outcome
    pub fn record_event(&self, outcome: &str) {
        self.webhook_events_total.with_label_values(&[outcome]).inc();
    }

    /// Count of webhook events with `outcome`
    pub fn event_count(&self, outcome: &str) -> u64 {
        self.webhook_events_total.with_label_values(&[outcome]).get()
    }
}

impl std::fmt::Debug for SyncMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncMetrics")
            .field("records_anchored_total", &self.records_anchored_total.get())
            .finish_non_exhaustive()
    }
}
