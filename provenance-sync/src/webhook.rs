//! Webhook Ingest: event-driven processing of store change notifications
//!
//! [`WebhookIngest::submit`] authenticates and validates a notification, then
//! hands it to a bounded queue drained by a fixed pool of workers. A full
//! queue is reported to the caller as [`Error::QueueFull`]. Workers retry
//! transient failures with linear backoff and dead-letter the event once
//! retries are exhausted or the pool is cancelled.

use crate::anchor::Anchor;
use crate::dlq::DeadLetterQueue;
use crate::engine::SyncState;
use crate::metrics::SyncMetrics;
use crate::snapshot::SnapshotStore;
use crate::tracker::{idempotency_key, IdempotencyTracker};
use crate::{Config, Error, Result};
use async_channel::{Receiver, Sender, TrySendError};
use parking_lot::Mutex;
use provenance_ledger::external::TX_ID_COLUMN;
use provenance_ledger::{Row, Table};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use subtle::ConstantTimeEq;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Signature header name
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Change kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    /// Row inserted
    Insert,
    /// Row updated
    Update,
    /// Row deleted
    Delete,
}

/// Change notification
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEvent {
    /// Change kind
    #[serde(rename = "type")]
    pub event_type: EventType,
    /// Table name
    pub table: String,
    /// New row (INSERT/UPDATE)
    #[serde(default)]
    pub record: Option<Row>,
    /// Previous row (UPDATE/DELETE)
    #[serde(default)]
    pub old_record: Option<Row>,
    /// Schema name
    #[serde(default)]
    pub schema: String,
    /// Sender timestamp
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl WebhookEvent {
    /// Table, primary key and row this event is about
    pub fn target(&self) -> Result<(Table, String, &Row)> {
        let table: Table = self
            .table
            .parse()
            .map_err(|_| Error::UnsupportedTable(self.table.clone()))?;

        let row = match self.event_type {
            EventType::Insert | EventType::Update => self.record.as_ref(),
            EventType::Delete => self.old_record.as_ref().or(self.record.as_ref()),
        }
        .ok_or_else(|| Error::InvalidPayload(format!("{:?} event without a record", self.event_type)))?;

        let id = table.row_id(row).ok_or_else(|| {
            Error::InvalidPayload(format!("{} record missing {}", table, table.primary_key()))
        })?;

        Ok((table, id, row))
    }
}

/// What processing did with an event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Snapshot written and hash marked processed
    Persisted {
        /// Chain transaction of the record
        tx_hash: String,
        /// Snapshot file
        path: PathBuf,
    },
    /// Already processed; nothing written
    Duplicate {
        /// Key found in the tracker
        key: String,
    },
    /// Tombstone written
    Tombstoned {
        /// Tombstone file
        path: PathBuf,
    },
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Persisted { .. } => "persisted",
            Outcome::Duplicate { .. } => "duplicate",
            Outcome::Tombstoned { .. } => "tombstoned",
        }
    }
}

/// Applies one event: anchor, deduplicate, snapshot
#[derive(Debug)]
pub struct EventProcessor {
    anchor: Arc<Anchor>,
    tracker: Arc<IdempotencyTracker>,
    snapshots: SnapshotStore,
    state: Arc<SyncState>,
}

impl EventProcessor {
    /// New processor
    pub fn new(
        anchor: Arc<Anchor>,
        tracker: Arc<IdempotencyTracker>,
        snapshots: SnapshotStore,
        state: Arc<SyncState>,
    ) -> Self {
        Self {
            anchor,
            tracker,
            snapshots,
            state,
        }
    }

    /// Process one event
    pub async fn process(&self, event: &WebhookEvent) -> Result<Outcome> {
        let (table, id, row) = event.target()?;
        let _guard = self.anchor.lock_record(table, &id).await;

        let outcome = match event.event_type {
            EventType::Insert | EventType::Update => self.process_record(table, &id, row).await?,
            EventType::Delete => {
                let path = self.snapshots.save_tombstone(table, &id, row.clone())?;
                info!(table = %table, id = %id, "Record deletion recorded");
                Outcome::Tombstoned { path }
            }
        };

        self.state.touch(table);
        Ok(outcome)
    }

    async fn process_record(&self, table: Table, id: &str, row: &Row) -> Result<Outcome> {
        let key = idempotency_key(table, id, row)?;
        if self.tracker.is_processed(&key) {
            debug!(table = %table, id, key = %key, "Record already processed");
            return Ok(Outcome::Duplicate { key });
        }

        let anchored = self.anchor.anchor(table, id, row).await?;
        if anchored.tx_hash != key && self.tracker.is_processed(&anchored.tx_hash) {
            self.tracker.bind(&key, &anchored.tx_hash)?;
            debug!(table = %table, id, tx_hash = %anchored.tx_hash, "Transaction already processed");
            return Ok(Outcome::Duplicate {
                key: anchored.tx_hash,
            });
        }

        let mut snapshot = row.clone();
        snapshot.insert(TX_ID_COLUMN.to_string(), Value::String(anchored.tx_hash.clone()));
        let path = self.snapshots.save_record(table, id, &snapshot)?;

        self.tracker.mark_processed(&anchored.tx_hash)?;
        if key != anchored.tx_hash {
            self.tracker.bind(&key, &anchored.tx_hash)?;
        }

        info!(
            table = %table,
            id,
            tx_hash = %anchored.tx_hash,
            created = anchored.created,
            "Record processed"
        );
        Ok(Outcome::Persisted {
            tx_hash: anchored.tx_hash,
            path,
        })
    }
}

/// Queued event
#[derive(Debug)]
struct Job {
    id: Uuid,
    event: WebhookEvent,
}

#[derive(Debug, Clone, Copy)]
struct RetryPolicy {
    max_attempts: u32,
    backoff_unit: Duration,
}

impl RetryPolicy {
    fn backoff(&self, attempt: u32) -> Duration {
        self.backoff_unit * attempt
    }
}

/// Bounded webhook worker pool
#[derive(Debug)]
pub struct WebhookIngest {
    sender: Sender<Job>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    cancel: CancellationToken,
    secret: Option<String>,
    capacity: usize,
    metrics: SyncMetrics,
}

impl WebhookIngest {
    /// Spawn `config.webhook.workers` workers
    pub fn start(
        config: &Config,
        processor: Arc<EventProcessor>,
        dlq: Arc<DeadLetterQueue>,
        metrics: SyncMetrics,
    ) -> Self {
        let capacity = config.webhook.queue_capacity.max(1);
        let (sender, receiver) = async_channel::bounded(capacity);
        let cancel = CancellationToken::new();
        let policy = RetryPolicy {
            max_attempts: config.webhook.max_retries.max(1),
            backoff_unit: Duration::from_millis(config.webhook.backoff_unit_ms),
        };

        let workers = (0..config.webhook.workers.max(1))
            .map(|n| {
                let worker = Worker {
                    n,
                    receiver: receiver.clone(),
                    processor: processor.clone(),
                    dlq: dlq.clone(),
                    cancel: cancel.clone(),
                    policy,
                    metrics: metrics.clone(),
                };
                tokio::spawn(worker.run())
            })
            .collect();

        info!(
            workers = config.webhook.workers.max(1),
            capacity,
            signed = config.webhook.secret.is_some(),
            "Webhook ingest started"
        );

        Self {
            sender,
            workers: Mutex::new(workers),
            cancel,
            secret: config.webhook.secret.clone(),
            capacity,
            metrics,
        }
    }

    /// Authenticate, validate and enqueue a notification
    ///
    /// Returns the ingest ID. Processing happens asynchronously.
    pub fn submit(&self, signature: Option<&str>, body: &[u8]) -> Result<Uuid> {
        let result = self.accept(signature, body);
        if let Err(e) = &result {
            self.metrics.record_event("rejected");
            warn!("Webhook rejected: {}", e);
        }
        result
    }

    fn accept(&self, signature: Option<&str>, body: &[u8]) -> Result<Uuid> {
        self.verify_signature(signature)?;

        let event: WebhookEvent = serde_json::from_slice(body)
            .map_err(|e| Error::InvalidPayload(format!("malformed webhook body: {}", e)))?;
        let (table, record_id, _) = event.target()?;

        let id = Uuid::now_v7();
        match self.sender.try_send(Job { id, event }) {
            Ok(()) => {
                debug!(%id, table = %table, record_id = %record_id, "Webhook queued");
                Ok(id)
            }
            Err(TrySendError::Full(_)) => Err(Error::QueueFull(self.capacity)),
            Err(TrySendError::Closed(_)) => Err(Error::NotRunning),
        }
    }

    fn verify_signature(&self, signature: Option<&str>) -> Result<()> {
        let Some(secret) = &self.secret else {
            return Ok(());
        };
        match signature {
            Some(sig) if !sig.is_empty() && bool::from(sig.as_bytes().ct_eq(secret.as_bytes())) => {
                Ok(())
            }
            _ => Err(Error::InvalidSignature),
        }
    }

    /// Events waiting in the queue
    pub fn queued(&self) -> usize {
        self.sender.len()
    }

    /// Stop accepting events, let workers drain the queue, and join them
    pub async fn shutdown(&self) {
        self.sender.close();
        let workers: Vec<_> = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                warn!("Webhook worker terminated abnormally: {}", e);
            }
        }
        info!("Webhook ingest stopped");
    }

    /// Interrupt workers; events in backoff are dead-lettered
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

struct Worker {
    n: usize,
    receiver: Receiver<Job>,
    processor: Arc<EventProcessor>,
    dlq: Arc<DeadLetterQueue>,
    cancel: CancellationToken,
    policy: RetryPolicy,
    metrics: SyncMetrics,
}

impl Worker {
    async fn run(self) {
        debug!(worker = self.n, "Webhook worker started");
        loop {
            let job = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => break,
                job = self.receiver.recv() => match job {
                    Ok(job) => job,
                    Err(_) => break,
                },
            };
            self.handle(job).await;
        }

        // Cancelled with events still queued
        while let Ok(job) = self.receiver.try_recv() {
            self.dead_letter(job, "cancelled before processing".to_string(), 0);
        }
        debug!(worker = self.n, "Webhook worker exited");
    }

    fn dead_letter(&self, job: Job, failure: String, attempts: u32) {
        self.metrics.record_event("dead_lettered");
        if let Err(e) = self.dlq.push(job.id, job.event, failure, attempts) {
            tracing::error!(id = %job.id, "Failed to write dead letter: {}", e);
        }
    }

    async fn handle(&self, job: Job) {
        let mut attempt = 0;
        let failure = loop {
            attempt += 1;
            let err = match self.processor.process(&job.event).await {
                Ok(outcome) => {
                    self.metrics.record_event(outcome.label());
                    return;
                }
                Err(e) => e,
            };

            if !err.is_retryable() || attempt >= self.policy.max_attempts {
                break err.to_string();
            }

            let delay = self.policy.backoff(attempt);
            warn!(
                id = %job.id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Webhook processing failed, retrying: {}",
                err
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break format!("cancelled after: {}", err),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.dead_letter(job, failure, attempt);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(value: Value) -> WebhookEvent {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_target_resolution() {
        let insert = event(json!({
            "type": "INSERT",
            "table": "drugs",
            "record": {"drug_id": "D1"},
            "schema": "public"
        }));
        let (table, id, _) = insert.target().unwrap();
        assert_eq!((table, id.as_str()), (Table::Drugs, "D1"));

        let delete = event(json!({
            "type": "DELETE",
            "table": "shipments",
            "old_record": {"shipment_id": "S1"}
        }));
        assert_eq!(delete.target().unwrap().1, "S1");

        let unknown = event(json!({"type": "INSERT", "table": "users", "record": {"id": 1}}));
        assert!(matches!(unknown.target(), Err(Error::UnsupportedTable(_))));

        let no_key = event(json!({"type": "UPDATE", "table": "drugs", "record": {"name": "x"}}));
        assert!(matches!(no_key.target(), Err(Error::InvalidPayload(_))));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_unit: Duration::from_millis(100),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(3), Duration::from_millis(300));
    }
}
