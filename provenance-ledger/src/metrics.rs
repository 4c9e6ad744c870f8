//! Metrics collection for observability
//!
//! This module provides Prometheus metrics for monitoring the ledger.
//!
//! # Metrics
//!
//! - `ledger_chain_blocks_total` - Blocks appended since start
//! - `ledger_chain_height` - Current chain height
//! - `ledger_operations_total` - Ledger Manager operations by operation and outcome
//! - `ledger_outbox_pending` - Unclosed outbox intents

use prometheus::{IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::sync::Arc;

/// Metrics collector
#[derive(Clone)]
pub struct Metrics {
    /// Blocks appended since start
    pub blocks_total: IntCounter,

    /// Current chain height
    pub chain_height: IntGauge,

    /// Operations by `operation` and `outcome`
    pub operations_total: IntCounterVec,

    /// Unclosed outbox intents
    pub outbox_pending: IntGauge,

    /// Prometheus registry
    pub registry: Arc<Registry>,
}

impl Metrics {
    /// Create new metrics collector
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let blocks_total =
            IntCounter::new("ledger_chain_blocks_total", "Blocks appended since start")?;
        registry.register(Box::new(blocks_total.clone()))?;

        let chain_height = IntGauge::new("ledger_chain_height", "Current chain height")?;
        registry.register(Box::new(chain_height.clone()))?;

        let operations_total = IntCounterVec::new(
            Opts::new("ledger_operations_total", "Ledger Manager operations"),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(operations_total.clone()))?;

        let outbox_pending = IntGauge::new("ledger_outbox_pending", "Unclosed outbox intents")?;
        registry.register(Box::new(outbox_pending.clone()))?;

        Ok(Self {
            blocks_total,
            chain_height,
            operations_total,
            outbox_pending,
            registry,
        })
    }

    /// Record a chain append
    pub fn record_block(&self, height: u64) {
        self.blocks_total.inc();
        self.chain_height.set(height as i64);
    }

    /// Record the outcome of a Ledger Manager operation
    pub fn record_operation(&self, operation: &str, success: bool) {
        let outcome = if success { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Count of recorded outcomes for `operation`
    pub fn operation_count(&self, operation: &str, success: bool) -> u64 {
        let outcome = if success { "success" } else { "failure" };
        self.operations_total
            .with_label_values(&[operation, outcome])
            .get()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics")
            .field("blocks_total", &self.blocks_total.get())
            .field("chain_height", &self.chain_height.get())
            .field("outbox_pending", &self.outbox_pending.get())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_are_independent() {
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();

        a.record_block(3);
        a.record_operation("create_drug", true);
        a.record_operation("create_drug", false);

        assert_eq!(a.blocks_total.get(), 1);
        assert_eq!(a.chain_height.get(), 3);
        assert_eq!(a.operation_count("create_drug", true), 1);
        assert_eq!(b.blocks_total.get(), 0);
        assert_eq!(a.registry.gather().len(), 4);
    }
}
