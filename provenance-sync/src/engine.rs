//! Sync Engine: periodic reconciliation of store rows onto the chain
//!
//! Each cycle pulls every row of each configured table and anchors the rows
//! whose `blockchain_tx_id` is empty or `"pending"`. The loop runs on its own
//! task and stops cooperatively: [`SyncEngine::stop`] signals a
//! [`CancellationToken`] and joins the task, so an in-flight cycle finishes
//! first. Periodic and forced cycles on the same table are serialized by a
//! per-table mutex.

use crate::anchor::{finalized_tx, Anchor};
use crate::metrics::SyncMetrics;
use crate::tracker::{idempotency_key, IdempotencyTracker};
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use provenance_ledger::storage::write_json_atomic;
use provenance_ledger::{Row, Table};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Per-table last successful sync, shared with webhook ingest
#[derive(Debug, Default)]
pub struct SyncState {
    tables: RwLock<BTreeMap<Table, DateTime<Utc>>>,
}

impl SyncState {
    /// Empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a successful sync of `table` now
    pub fn touch(&self, table: Table) {
        self.tables.write().insert(table, Utc::now());
    }

    /// Last successful sync of `table`
    pub fn last_sync(&self, table: Table) -> Option<DateTime<Utc>> {
        self.tables.read().get(&table).copied()
    }

    /// Most recent sync across all tables
    pub fn latest(&self) -> Option<DateTime<Utc>> {
        self.tables.read().values().max().copied()
    }

    /// Snapshot of every table's last sync
    pub fn all(&self) -> BTreeMap<Table, DateTime<Utc>> {
        self.tables.read().clone()
    }
}

/// Cycle outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Every row handled
    Success,
    /// The pull failed or some rows could not be anchored
    Error,
}

/// Log record of one table cycle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncLog {
    /// Table synced
    pub table: Table,
    /// Cycle end
    pub last_sync: DateTime<Utc>,
    /// Rows pushed from local ledgers to the store
    pub records_sent: usize,
    /// Rows pulled from the store
    pub records_received: usize,
    /// Rows that got a new chain transaction
    pub records_anchored: usize,
    /// Outcome
    pub status: SyncOutcome,
    /// First error, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Engine status report
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncStatus {
    /// Whether the periodic loop is running
    pub is_running: bool,
    /// Most recent successful sync of any table
    pub last_sync: Option<DateTime<Utc>>,
    /// Seconds between cycles
    pub sync_interval_secs: u64,
    /// Last successful sync per table
    pub tables: BTreeMap<Table, DateTime<Utc>>,
}

struct Runner {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct EngineInner {
    config: Config,
    anchor: Arc<Anchor>,
    tracker: Arc<IdempotencyTracker>,
    state: Arc<SyncState>,
    table_locks: HashMap<Table, tokio::sync::Mutex<()>>,
    metrics: SyncMetrics,
    log_dir: PathBuf,
}

/// Periodic sync engine
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    runner: Mutex<Option<Runner>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("tables", &self.inner.config.sync.tables)
            .field("is_running", &self.is_running())
            .finish()
    }
}

impl SyncEngine {
    /// New stopped engine
    pub fn new(
        config: Config,
        anchor: Arc<Anchor>,
        tracker: Arc<IdempotencyTracker>,
        state: Arc<SyncState>,
        metrics: SyncMetrics,
    ) -> Result<Self> {
        let log_dir = config.sync_log_dir();
        std::fs::create_dir_all(&log_dir)?;

        let table_locks = config
            .sync
            .tables
            .iter()
            .map(|t| (*t, tokio::sync::Mutex::new(())))
            .collect();

        Ok(Self {
            inner: Arc::new(EngineInner {
                config,
                anchor,
                tracker,
                state,
                table_locks,
                metrics,
                log_dir,
            }),
            runner: Mutex::new(None),
        })
    }

    /// Spawn the periodic loop; the first cycle runs immediately
    pub fn start(&self) -> Result<()> {
        let mut runner = self.runner.lock();
        if runner.is_some() {
            return Err(Error::AlreadyRunning);
        }

        let cancel = CancellationToken::new();
        let inner = self.inner.clone();
        let token = cancel.clone();
        let handle = tokio::spawn(async move { inner.run(token).await });

        *runner = Some(Runner { cancel, handle });
        info!(
            interval_secs = self.inner.config.sync.interval_secs,
            tables = ?self.inner.config.sync.tables,
            "Sync engine started"
        );
        Ok(())
    }

    /// Signal the loop and wait for it to finish
    pub async fn stop(&self) -> Result<()> {
        let runner = self.runner.lock().take().ok_or(Error::NotRunning)?;
        runner.cancel.cancel();
        if let Err(e) = runner.handle.await {
            error!("Sync loop terminated abnormally: {}", e);
        }
        info!("Sync engine stopped");
        Ok(())
    }

    /// Whether the loop is running
    pub fn is_running(&self) -> bool {
        self.runner.lock().is_some()
    }

    /// Run one cycle now over every table
    pub async fn force_sync(&self) -> Result<Vec<SyncLog>> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        info!("Forced sync requested");
        Ok(self.inner.sync_all().await)
    }

    /// Run one cycle on a single table, whether or not the loop is running
    pub async fn sync_table(&self, table: Table) -> SyncLog {
        self.inner.sync_table(table).await
    }

    /// Status report
    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            is_running: self.is_running(),
            last_sync: self.inner.state.latest(),
            sync_interval_secs: self.inner.config.sync.interval_secs,
            tables: self.inner.state.all(),
        }
    }

    /// Push local ledger changes to the store
    ///
    /// Pushing is not implemented: the store is the system of record and is
    /// written by the Ledger Manager directly. Always returns 0.
    pub fn push_local_changes(&self, table: Table) -> usize {
        self.inner.push_local_changes(table)
    }
}

impl EngineInner {
    async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.sync_all().await;

        let mut ticker = tokio::time::interval(self.config.sync.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.sync_all().await;
                }
            }
        }
        debug!("Sync loop exited");
    }

    async fn sync_all(&self) -> Vec<SyncLog> {
        let mut logs = Vec::with_capacity(self.config.sync.tables.len());
        for table in &self.config.sync.tables {
            logs.push(self.sync_table(*table).await);
        }
        logs
    }

    async fn sync_table(&self, table: Table) -> SyncLog {
        let _flight = match self.table_locks.get(&table) {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let mut log = match self.pull_and_anchor(table).await {
            Ok(log) => log,
            Err(e) => {
                warn!(table = %table, "Sync pull failed: {}", e);
                SyncLog {
                    table,
                    last_sync: Utc::now(),
                    records_sent: 0,
                    records_received: 0,
                    records_anchored: 0,
                    status: SyncOutcome::Error,
                    error: Some(e.to_string()),
                }
            }
        };
        log.records_sent = self.push_local_changes(table);

        let success = log.status == SyncOutcome::Success;
        if success {
            self.state.touch(table);
        }
        self.metrics.record_cycle(table.as_str(), success);
        self.write_log(&log);

        info!(
            table = %table,
            received = log.records_received,
            anchored = log.records_anchored,
            status = ?log.status,
            "Sync cycle finished"
        );
        log
    }

    async fn pull_and_anchor(&self, table: Table) -> Result<SyncLog> {
        let rows = self
            .anchor
            .manager()
            .store()
            .select(table, "*", &Vec::new())
            .await?;

        let mut anchored = 0;
        let mut first_error = None;
        for row in &rows {
            if finalized_tx(row).is_some() {
                continue;
            }
            let Some(id) = table.row_id(row) else {
                warn!(table = %table, "Skipping row without primary key");
                continue;
            };

            let _guard = self.anchor.lock_record(table, &id).await;
            match self.anchor_row(table, &id, row).await {
                Ok(true) => anchored += 1,
                Ok(false) => {}
                Err(e) => {
                    // Transient failures are skipped; the next cycle retries
                    warn!(table = %table, id = %id, "Failed to anchor row: {}", e);
                    first_error.get_or_insert_with(|| format!("{}: {}", id, e));
                }
            }
        }

        Ok(SyncLog {
            table,
            last_sync: Utc::now(),
            records_sent: 0,
            records_received: rows.len(),
            records_anchored: anchored,
            status: if first_error.is_none() {
                SyncOutcome::Success
            } else {
                SyncOutcome::Error
            },
            error: first_error,
        })
    }

    /// Anchor one unfinalized row; returns whether a transaction was appended
    async fn anchor_row(&self, table: Table, id: &str, row: &Row) -> Result<bool> {
        let key = idempotency_key(table, id, row)?;
        if let Some(tx_hash) = self.tracker.bound_tx(&key) {
            // Already anchored when the change arrived by webhook
            self.anchor.write_back(table, id, &tx_hash).await?;
            return Ok(false);
        }
        if self.tracker.is_processed(&key) {
            debug!(table = %table, id, key = %key, "Record already processed");
            return Ok(false);
        }

        let anchored = self.anchor.anchor(table, id, row).await?;
        self.tracker.mark_processed(&anchored.tx_hash)?;
        self.tracker.bind(&key, &anchored.tx_hash)?;
        Ok(anchored.created)
    }

    fn push_local_changes(&self, table: Table) -> usize {
        debug!(table = %table, "Local-to-store push not implemented; nothing sent");
        0
    }

    fn write_log(&self, log: &SyncLog) {
        let path = self.log_dir.join(format!(
            "{}-sync-{}.json",
            log.table,
            log.last_sync.format("%Y%m%d-%H%M%S-%9f")
        ));
        if let Err(e) = write_json_atomic(&path, log) {
            error!(path = %path.display(), "Failed to write sync log: {}", e);
        }
    }
}
