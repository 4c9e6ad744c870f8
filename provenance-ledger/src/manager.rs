//! Ledger Manager: drug and shipment operations across all stores
//!
//! Each operation validates against the common ledger, plans its writes into
//! an outbox [`Intent`] and executes the steps strictly in the order
//! chain → manufacturer ledger → common ledger → external store. Operations
//! touching the same drug or shipment are serialized by per-entity locks.
//!
//! # Example
//!
//! ```no_run
//! use provenance_ledger::{Config, LedgerManager, MemoryStore};
//! use provenance_ledger::types::CreateDrugParams;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> provenance_ledger::Result<()> {
//!     let manager = LedgerManager::open(Config::default(), Arc::new(MemoryStore::new())).await?;
//!     let verification_hash = manager
//!         .create_drug(CreateDrugParams {
//!             drug_id: "D1".into(),
//!             manufacturer_id: "M1".into(),
//!             name: "Amoxicillin".into(),
//!             description: "500mg capsules".into(),
//!             user_id: "user-1".into(),
//!             location: "Plant 4".into(),
//!         })
//!         .await?;
//!     assert!(manager.verify_drug("D1").await?);
//!     # let _ = verification_hash;
//!     Ok(())
//! }
//! ```

use crate::actor::{spawn_chain_actor, ChainHandle};
use crate::chain::{
    validate, Block, ChainStatus, ConsistencyReport, Transaction, TransactionVerification,
};
use crate::crypto::verification_hash;
use crate::external::{
    eq, from_row, is_finalized_tx, to_row, DrugRow, ExternalStore, Row, ShipmentRow,
    StatusUpdateRow, Table, TX_ID_COLUMN,
};
use crate::ledger::{
    CommonShipmentRecord, LedgerChange, DRUG_CREATED, SHIPMENT_CREATED,
};
use crate::ledger_store::LedgerStore;
use crate::locks::KeyedLocks;
use crate::metrics::Metrics;
use crate::outbox::{Intent, Outbox, Step};
use crate::storage::ChainStorage;
use crate::types::{
    CreateDrugParams, CreateShipmentParams, DrugStatus, RevertDrugParams, ShipmentStatus, Status,
    TxData, TxPayload, UpdateShipmentStatusParams,
};
use crate::{Config, Error, Result};
use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Recommendation when operations were interrupted
pub const REPLAY_RECOMMENDATION: &str = "Run reconcile to replay unclosed operation intents";

/// Outcome of replaying unclosed intents
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Intents that completed
    pub replayed: usize,
    /// Intents that failed again and remain open
    pub failed: usize,
}

/// Orchestrator over chain, ledgers and external store
pub struct LedgerManager {
    chain: ChainHandle,
    ledgers: Arc<LedgerStore>,
    store: Arc<dyn ExternalStore>,
    outbox: Outbox,
    locks: KeyedLocks,
    metrics: Metrics,
    config: Config,
}

impl std::fmt::Debug for LedgerManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerManager")
            .field("data_dir", &self.config.data_dir)
            .field("pending_intents", &self.outbox.len())
            .finish()
    }
}

impl LedgerManager {
    /// Open all local stores and spawn the chain actor
    pub async fn open(config: Config, store: Arc<dyn ExternalStore>) -> Result<Self> {
        let metrics = Metrics::new()
            .map_err(|e| Error::Config(format!("Failed to register metrics: {}", e)))?;

        let chain = spawn_chain_actor(
            ChainStorage::open(&config)?,
            config.chain.mailbox_capacity,
            metrics.clone(),
        )?;
        let ledgers = Arc::new(LedgerStore::open(&config)?);
        let outbox = Outbox::open(&config)?;
        metrics.outbox_pending.set(outbox.len() as i64);

        info!(
            service = %config.service_name,
            data_dir = %config.data_dir.display(),
            "Ledger manager opened"
        );

        Ok(Self {
            chain,
            ledgers,
            store,
            outbox,
            locks: KeyedLocks::new(),
            metrics,
            config,
        })
    }

    /// Chain actor handle
    pub fn chain(&self) -> &ChainHandle {
        &self.chain
    }

    /// Ledger files
    pub fn ledgers(&self) -> &LedgerStore {
        &self.ledgers
    }

    /// External store
    pub fn store(&self) -> &Arc<dyn ExternalStore> {
        &self.store
    }

    /// Metrics
    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Configuration
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Unclosed intents, oldest first
    pub fn pending_intents(&self) -> Vec<Intent> {
        self.outbox.pending()
    }

    /// Register a drug and return its verification hash
    pub async fn create_drug(&self, params: CreateDrugParams) -> Result<String> {
        let result = self.create_drug_inner(&params).await;
        self.finish("create_drug", &params.drug_id, result)
    }

    async fn create_drug_inner(&self, params: &CreateDrugParams) -> Result<String> {
        params.validate()?;
        let keys = [drug_key(&params.drug_id)];
        let _guard = self.locks.lock_all(keys.iter().map(String::as_str)).await;
        self.settle_pending(&keys).await?;

        if self.ledgers.read_common(|c| c.drug(&params.drug_id).is_some()) {
            return Err(Error::Conflict(format!(
                "drug {} already exists in ledger",
                params.drug_id
            )));
        }

        let now = Utc::now();
        let op_id = Uuid::now_v7();
        let vhash = verification_hash(&params.drug_id, &params.manufacturer_id, &now);
        let created = LedgerChange::AddDrug {
            drug_id: params.drug_id.clone(),
            manufacturer_id: params.manufacturer_id.clone(),
            verification_hash: vhash.clone(),
            entry: Status::new(DrugStatus::Created.as_str(), now, DRUG_CREATED),
        };

        let drug_row = to_row(&DrugRow {
            drug_id: params.drug_id.clone(),
            manufacturer_id: params.manufacturer_id.clone(),
            name: params.name.clone(),
            description: params.description.clone(),
            status: DrugStatus::Created.to_string(),
            verification_hash: vhash.clone(),
            blockchain_tx_id: String::new(),
            created_at: now,
            updated_at: now,
            reverted_at: None,
        })?;

        let steps = vec![
            Step::Chain {
                slot: 0,
                payload: TxPayload::DrugCreate {
                    drug_id: params.drug_id.clone(),
                    manufacturer_id: params.manufacturer_id.clone(),
                    name: params.name.clone(),
                    description: params.description.clone(),
                    verification_hash: Some(vhash.clone()),
                    created_at: now,
                },
                link_to: None,
            },
            Step::ManufacturerLedger {
                manufacturer_id: params.manufacturer_id.clone(),
                change: created.clone(),
            },
            Step::CommonLedger { change: created },
            Step::StoreInsert {
                table: Table::Drugs,
                row: drug_row,
                tx_slot: Some(0),
            },
            Step::StoreInsert {
                table: Table::DrugStatusUpdates,
                row: status_update_row(
                    op_id,
                    0,
                    Subject::Drug(&params.drug_id),
                    DrugStatus::Created.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(0),
            },
        ];

        self.execute(Intent::new("create_drug", op_id, steps)).await?;
        Ok(vhash)
    }

    /// Register a shipment and move its drug to `in_transit`
    ///
    /// Returns the `shipment_create` transaction hash.
    pub async fn create_shipment(&self, params: CreateShipmentParams) -> Result<String> {
        let result = self.create_shipment_inner(&params).await;
        self.finish("create_shipment", &params.shipment_id, result)
    }

    async fn create_shipment_inner(&self, params: &CreateShipmentParams) -> Result<String> {
        params.validate()?;
        let keys = [drug_key(&params.drug_id), shipment_key(&params.shipment_id)];
        let _guard = self.locks.lock_all(keys.iter().map(String::as_str)).await;
        self.settle_pending(&keys).await?;

        let drug = self.ledgers.read_common(|c| {
            if c.shipment(&params.shipment_id).is_some() {
                return Err(Error::Conflict(format!(
                    "shipment {} already exists in ledger",
                    params.shipment_id
                )));
            }
            c.drug(&params.drug_id)
                .cloned()
                .ok_or_else(|| Error::DrugNotFound(params.drug_id.clone()))
        })?;
        if drug.manufacturer_id != params.manufacturer_id {
            return Err(Error::Validation(format!(
                "drug {} belongs to manufacturer {}",
                params.drug_id, drug.manufacturer_id
            )));
        }
        drug.record.current_status.ensure_transition(DrugStatus::InTransit)?;

        let now = Utc::now();
        let op_id = Uuid::now_v7();
        let shipment_created = LedgerChange::AddShipment {
            shipment_id: params.shipment_id.clone(),
            drug_id: params.drug_id.clone(),
            manufacturer_id: params.manufacturer_id.clone(),
            distributor_id: params.distributor_id.clone(),
            entry: Status::new(ShipmentStatus::Created.as_str(), now, SHIPMENT_CREATED),
        };
        let drug_moved = LedgerChange::DrugStatus {
            drug_id: params.drug_id.clone(),
            status: DrugStatus::InTransit,
            entry: Status::new(
                DrugStatus::InTransit.as_str(),
                now,
                format!("Drug added to shipment {}", params.shipment_id),
            ),
        };

        let shipment_row = to_row(&ShipmentRow {
            shipment_id: params.shipment_id.clone(),
            drug_id: params.drug_id.clone(),
            manufacturer_id: params.manufacturer_id.clone(),
            distributor_id: params.distributor_id.clone(),
            status: ShipmentStatus::Created.to_string(),
            blockchain_tx_id: String::new(),
            created_at: now,
            updated_at: now,
        })?;

        let steps = vec![
            Step::Chain {
                slot: 0,
                payload: TxPayload::ShipmentCreate {
                    shipment_id: params.shipment_id.clone(),
                    drug_id: params.drug_id.clone(),
                    manufacturer_id: params.manufacturer_id.clone(),
                    distributor_id: params.distributor_id.clone(),
                    created_at: now,
                },
                link_to: None,
            },
            Step::Chain {
                slot: 1,
                payload: TxPayload::DrugUpdate {
                    drug_id: params.drug_id.clone(),
                    status: DrugStatus::InTransit,
                    updated_by: params.user_id.clone(),
                    updated_at: now,
                },
                link_to: Some(0),
            },
            Step::ManufacturerLedger {
                manufacturer_id: params.manufacturer_id.clone(),
                change: shipment_created.clone(),
            },
            Step::ManufacturerLedger {
                manufacturer_id: params.manufacturer_id.clone(),
                change: drug_moved.clone(),
            },
            Step::CommonLedger {
                change: shipment_created,
            },
            Step::CommonLedger { change: drug_moved },
            Step::StoreInsert {
                table: Table::Shipments,
                row: shipment_row,
                tx_slot: Some(0),
            },
            Step::StoreInsert {
                table: Table::ShipmentStatusUpdates,
                row: status_update_row(
                    op_id,
                    0,
                    Subject::Shipment(&params.shipment_id),
                    ShipmentStatus::Created.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(0),
            },
            Step::StoreUpdate {
                table: Table::Drugs,
                id: params.drug_id.clone(),
                patch: patch([
                    ("status", json!(DrugStatus::InTransit.as_str())),
                    ("updated_at", json!(now)),
                ]),
                tx_slot: Some(1),
            },
            Step::StoreInsert {
                table: Table::DrugStatusUpdates,
                row: status_update_row(
                    op_id,
                    1,
                    Subject::Drug(&params.drug_id),
                    DrugStatus::InTransit.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(1),
            },
        ];

        let intent = self
            .execute(Intent::new("create_shipment", op_id, steps))
            .await?;
        slot_hash(&intent, 0)
    }

    /// Move a shipment to a new status; `delivered` cascades to its drug
    ///
    /// Returns the `shipment_update` transaction hash.
    pub async fn update_shipment_status(&self, params: UpdateShipmentStatusParams) -> Result<String> {
        let result = self.update_shipment_status_inner(&params).await;
        self.finish("update_shipment_status", &params.shipment_id, result)
    }

    async fn update_shipment_status_inner(&self, params: &UpdateShipmentStatusParams) -> Result<String> {
        let status = params.validate()?;

        // drug_id of a shipment never changes, so it can be read before locking
        let drug_id = self.ledgers.read_common(|c| {
            c.shipment(&params.shipment_id)
                .map(|s| s.record.drug_id.clone())
                .ok_or_else(|| Error::ShipmentNotFound(params.shipment_id.clone()))
        })?;
        let keys = [drug_key(&drug_id), shipment_key(&params.shipment_id)];
        let _guard = self.locks.lock_all(keys.iter().map(String::as_str)).await;
        self.settle_pending(&keys).await?;

        let (shipment, drug) = self.ledgers.read_common(|c| {
            let shipment = c
                .shipment(&params.shipment_id)
                .cloned()
                .ok_or_else(|| Error::ShipmentNotFound(params.shipment_id.clone()))?;
            let drug = c
                .drug(&drug_id)
                .cloned()
                .ok_or_else(|| Error::DrugNotFound(drug_id.clone()))?;
            Ok::<_, Error>((shipment, drug))
        })?;
        shipment.record.current_status.ensure_transition(status)?;

        let cascade = status == ShipmentStatus::Delivered;
        let cascade = if cascade && !drug.record.current_status.can_transition_to(DrugStatus::Delivered) {
            warn!(
                shipment_id = %params.shipment_id,
                drug_id = %drug_id,
                drug_status = %drug.record.current_status,
                "Shipment delivered but drug cannot move to delivered; cascade skipped"
            );
            false
        } else {
            cascade
        };

        let now = Utc::now();
        let op_id = Uuid::now_v7();
        let manufacturer_id = shipment.manufacturer_id.clone();
        let shipment_moved = LedgerChange::ShipmentStatus {
            shipment_id: params.shipment_id.clone(),
            status,
            entry: Status::new(
                status.as_str(),
                now,
                format!("Shipment status updated to {}", status),
            ),
        };
        let drug_delivered = LedgerChange::DrugStatus {
            drug_id: drug_id.clone(),
            status: DrugStatus::Delivered,
            entry: Status::new(
                DrugStatus::Delivered.as_str(),
                now,
                format!("Drug delivered via shipment {}", params.shipment_id),
            ),
        };

        let mut chain_steps = vec![Step::Chain {
            slot: 0,
            payload: TxPayload::ShipmentUpdate {
                shipment_id: params.shipment_id.clone(),
                status,
                updated_by: params.user_id.clone(),
                updated_at: now,
            },
            link_to: None,
        }];
        let mut manufacturer_steps = vec![Step::ManufacturerLedger {
            manufacturer_id: manufacturer_id.clone(),
            change: shipment_moved.clone(),
        }];
        let mut common_steps = vec![Step::CommonLedger {
            change: shipment_moved,
        }];
        let mut store_steps = vec![
            Step::StoreUpdate {
                table: Table::Shipments,
                id: params.shipment_id.clone(),
                patch: patch([("status", json!(status.as_str())), ("updated_at", json!(now))]),
                tx_slot: Some(0),
            },
            Step::StoreInsert {
                table: Table::ShipmentStatusUpdates,
                row: status_update_row(
                    op_id,
                    0,
                    Subject::Shipment(&params.shipment_id),
                    status.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(0),
            },
        ];

        if cascade {
            chain_steps.push(Step::Chain {
                slot: 1,
                payload: TxPayload::DrugUpdate {
                    drug_id: drug_id.clone(),
                    status: DrugStatus::Delivered,
                    updated_by: params.user_id.clone(),
                    updated_at: now,
                },
                link_to: Some(0),
            });
            manufacturer_steps.push(Step::ManufacturerLedger {
                manufacturer_id,
                change: drug_delivered.clone(),
            });
            common_steps.push(Step::CommonLedger {
                change: drug_delivered,
            });
            store_steps.push(Step::StoreUpdate {
                table: Table::Drugs,
                id: drug_id.clone(),
                patch: patch([
                    ("status", json!(DrugStatus::Delivered.as_str())),
                    ("updated_at", json!(now)),
                ]),
                tx_slot: Some(1),
            });
            store_steps.push(Step::StoreInsert {
                table: Table::DrugStatusUpdates,
                row: status_update_row(
                    op_id,
                    1,
                    Subject::Drug(&drug_id),
                    DrugStatus::Delivered.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(1),
            });
        }

        let steps = chain_steps
            .into_iter()
            .chain(manufacturer_steps)
            .chain(common_steps)
            .chain(store_steps)
            .collect();

        let intent = self
            .execute(Intent::new("update_shipment_status", op_id, steps))
            .await?;
        slot_hash(&intent, 0)
    }

    /// Revert a drug (terminal); returns the `drug_revert` transaction hash
    pub async fn revert_drug(&self, params: RevertDrugParams) -> Result<String> {
        let result = self.revert_drug_inner(&params).await;
        self.finish("revert_drug", &params.drug_id, result)
    }

    async fn revert_drug_inner(&self, params: &RevertDrugParams) -> Result<String> {
        params.validate()?;
        let keys = [drug_key(&params.drug_id)];
        let _guard = self.locks.lock_all(keys.iter().map(String::as_str)).await;
        self.settle_pending(&keys).await?;

        let drug = self.ledgers.read_common(|c| {
            c.drug(&params.drug_id)
                .cloned()
                .ok_or_else(|| Error::DrugNotFound(params.drug_id.clone()))
        })?;
        if !params.manufacturer_id.is_empty() && drug.manufacturer_id != params.manufacturer_id {
            return Err(Error::Validation(format!(
                "drug {} belongs to manufacturer {}",
                params.drug_id, drug.manufacturer_id
            )));
        }
        drug.record.current_status.ensure_transition(DrugStatus::Reverted)?;

        let now = Utc::now();
        let op_id = Uuid::now_v7();
        let reverted = LedgerChange::DrugStatus {
            drug_id: params.drug_id.clone(),
            status: DrugStatus::Reverted,
            entry: Status::new(
                DrugStatus::Reverted.as_str(),
                now,
                format!("Drug reverted: {}", params.reason),
            ),
        };

        let steps = vec![
            Step::Chain {
                slot: 0,
                payload: TxPayload::DrugRevert {
                    drug_id: params.drug_id.clone(),
                    reason: params.reason.clone(),
                    updated_by: params.user_id.clone(),
                    reverted_at: now,
                },
                link_to: None,
            },
            Step::ManufacturerLedger {
                manufacturer_id: drug.manufacturer_id.clone(),
                change: reverted.clone(),
            },
            Step::CommonLedger { change: reverted },
            Step::StoreUpdate {
                table: Table::Drugs,
                id: params.drug_id.clone(),
                patch: patch([
                    ("status", json!(DrugStatus::Reverted.as_str())),
                    ("reverted_at", json!(now)),
                    ("updated_at", json!(now)),
                ]),
                tx_slot: Some(0),
            },
            Step::StoreInsert {
                table: Table::DrugStatusUpdates,
                row: status_update_row(
                    op_id,
                    0,
                    Subject::Drug(&params.drug_id),
                    DrugStatus::Reverted.as_str(),
                    &params.location,
                    &params.user_id,
                    now,
                )?,
                tx_slot: Some(0),
            },
        ];

        let intent = self
            .execute(Intent::new("revert_drug", op_id, steps))
            .await?;
        slot_hash(&intent, 0)
    }

    /// Check a drug's verification hash and latest chain transaction
    ///
    /// Returns `Ok(false)` on any mismatch; errors only if the drug is absent
    /// from the common ledger or the external store.
    pub async fn verify_drug(&self, drug_id: &str) -> Result<bool> {
        let ledger_hash = self.ledgers.read_common(|c| {
            c.drug(drug_id)
                .map(|d| d.verification_hash.clone())
                .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))
        })?;

        let row = self
            .store
            .select(Table::Drugs, "*", &eq("drug_id", drug_id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))?;
        let row: DrugRow = from_row(row)?;

        if row.verification_hash != ledger_hash {
            warn!(drug_id, "Verification hash mismatch between store and common ledger");
            return Ok(false);
        }

        if !is_finalized_tx(Some(&row.blockchain_tx_id)) {
            warn!(drug_id, "Drug has no anchored chain transaction");
            return Ok(false);
        }

        match self.chain.get_transaction(&row.blockchain_tx_id).await {
            Ok(block) => {
                let valid = validate(&block.tx_hash, &block.tx_data);
                if !valid {
                    warn!(drug_id, tx_hash = %block.tx_hash, "Chain transaction failed validation");
                }
                Ok(valid)
            }
            Err(Error::TransactionNotFound(tx_hash)) => {
                warn!(drug_id, tx_hash = %tx_hash, "Drug references a transaction missing from the chain");
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    /// Drug history from the common ledger
    pub fn drug_history(&self, drug_id: &str) -> Result<Vec<Status>> {
        self.ledgers.read_common(|c| c.drug_history(drug_id))
    }

    /// Shipment history from the common ledger
    pub fn shipment_history(&self, shipment_id: &str) -> Result<Vec<Status>> {
        self.ledgers.read_common(|c| c.shipment_history(shipment_id))
    }

    /// Drug history from its manufacturer's ledger
    pub fn manufacturer_drug_history(&self, manufacturer_id: &str, drug_id: &str) -> Result<Vec<Status>> {
        self.ledgers.manufacturer(manufacturer_id)?.drug_history(drug_id)
    }

    /// Shipments addressed to a distributor
    pub fn distributor_shipments(&self, distributor_id: &str) -> Vec<CommonShipmentRecord> {
        self.ledgers
            .read_common(|c| c.distributor_shipments(distributor_id))
    }

    /// Drug status rows from the external store
    pub async fn drug_status_updates(&self, drug_id: &str) -> Result<Vec<StatusUpdateRow>> {
        self.status_updates(Table::DrugStatusUpdates, "drug_id", drug_id)
            .await
    }

    /// Shipment status rows from the external store
    pub async fn shipment_status_updates(&self, shipment_id: &str) -> Result<Vec<StatusUpdateRow>> {
        self.status_updates(Table::ShipmentStatusUpdates, "shipment_id", shipment_id)
            .await
    }

    async fn status_updates(&self, table: Table, column: &str, id: &str) -> Result<Vec<StatusUpdateRow>> {
        let mut rows = self
            .store
            .select(table, "*", &eq(column, id))
            .await?
            .into_iter()
            .map(from_row::<StatusUpdateRow>)
            .collect::<Result<Vec<_>>>()?;
        rows.sort_by_key(|r| r.timestamp);
        Ok(rows)
    }

    /// Block containing a transaction
    pub async fn get_transaction(&self, tx_hash: &str) -> Result<Block> {
        self.chain.get_transaction(tx_hash).await
    }

    /// Recompute a stored transaction's hash
    pub async fn verify_transaction(&self, tx_hash: &str) -> Result<TransactionVerification> {
        self.chain.verify_transaction(tx_hash).await
    }

    /// Chain summary
    pub async fn chain_status(&self) -> Result<ChainStatus> {
        self.chain.status().await
    }

    /// Chain invariants plus unclosed operation intents
    pub async fn consistency_check(&self) -> ConsistencyReport {
        let report = self.chain.consistency_check().await;
        if !report.is_consistent() {
            return report;
        }

        let pending = self.outbox.pending();
        match pending.first() {
            None => report,
            Some(oldest) => {
                let step = oldest
                    .steps
                    .get(oldest.next_step)
                    .map(Step::label)
                    .unwrap_or("done");
                let mut report = ConsistencyReport::inconsistent(
                    format!(
                        "{} unclosed operation intent(s); oldest {} {} stopped at step {} ({}){}",
                        pending.len(),
                        oldest.operation,
                        oldest.op_id,
                        oldest.next_step,
                        step,
                        oldest
                            .last_error
                            .as_deref()
                            .map(|e| format!(": {}", e))
                            .unwrap_or_default()
                    ),
                    None,
                );
                report.recommendation = Some(REPLAY_RECOMMENDATION.to_string());
                warn!(pending = pending.len(), "Unclosed operation intents");
                report
            }
        }
    }

    /// Replay every unclosed intent from its next step
    pub async fn reconcile(&self) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for intent in self.outbox.pending() {
            let keys = lock_keys(&intent);
            let _guard = self.locks.lock_all(keys.iter().map(String::as_str)).await;

            // A live operation may have finished it while we waited
            let Some(intent) = self.outbox.get(intent.op_id) else {
                continue;
            };

            let op_id = intent.op_id;
            let operation = intent.operation.clone();
            match self.execute(intent).await {
                Ok(_) => {
                    info!(%op_id, operation = %operation, "Replayed operation intent");
                    summary.replayed += 1;
                }
                Err(e) => {
                    error!(%op_id, operation = %operation, "Replay failed: {}", e);
                    summary.failed += 1;
                }
            }
        }

        summary
    }

    /// Replay unclosed intents touching any of `held`
    ///
    /// Callers hold the locks for `held`. Every operation on a shipment also
    /// holds its drug's lock, so an intent sharing one held key cannot be
    /// driven concurrently elsewhere. New operations only run once earlier
    /// intents on the same entities have closed; a replay failure aborts them.
    async fn settle_pending(&self, held: &[String]) -> Result<()> {
        for pending in self.outbox.pending() {
            if !lock_keys(&pending).iter().any(|k| held.contains(k)) {
                continue;
            }
            let Some(intent) = self.outbox.get(pending.op_id) else {
                continue;
            };

            let op_id = intent.op_id;
            let operation = intent.operation.clone();
            info!(%op_id, operation = %operation, "Replaying unclosed intent before new operation");
            if let Err(e) = self.execute(intent).await {
                warn!(%op_id, operation = %operation, "Unclosed intent still failing: {}", e);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop the chain actor
    pub async fn shutdown(&self) -> Result<()> {
        self.chain.shutdown().await
    }

    fn finish<T>(&self, operation: &str, subject: &str, result: Result<T>) -> Result<T> {
        self.metrics.record_operation(operation, result.is_ok());
        match &result {
            Ok(_) => info!(operation, subject, "Operation completed"),
            Err(e) => warn!(operation, subject, "Operation failed: {}", e),
        }
        result
    }

    async fn execute(&self, mut intent: Intent) -> Result<Intent> {
        intent.attempts += 1;
        intent.last_error = None;
        self.outbox.record(&intent)?;
        self.metrics.outbox_pending.set(self.outbox.len() as i64);

        while !intent.is_complete() {
            let step = intent.steps[intent.next_step].clone();
            if let Err(e) = self.apply_step(&mut intent, &step).await {
                error!(
                    op_id = %intent.op_id,
                    operation = %intent.operation,
                    step = step.label(),
                    index = intent.next_step,
                    "Operation step failed: {}",
                    e
                );
                intent.last_error = Some(e.to_string());
                if let Err(persist) = self.outbox.record(&intent) {
                    error!(op_id = %intent.op_id, "Failed to record intent failure: {}", persist);
                }
                return Err(e);
            }
            intent.next_step += 1;
            self.outbox.record(&intent)?;
        }

        self.outbox.complete(intent.op_id)?;
        self.metrics.outbox_pending.set(self.outbox.len() as i64);
        debug!(op_id = %intent.op_id, operation = %intent.operation, "Operation intent closed");
        Ok(intent)
    }

    async fn apply_step(&self, intent: &mut Intent, step: &Step) -> Result<()> {
        let replay = intent.attempts > 1;

        match step {
            Step::Chain {
                slot,
                payload,
                link_to,
            } => {
                if intent.tx_hashes.contains_key(slot) {
                    return Ok(());
                }
                if replay {
                    let existing = self
                        .chain
                        .blocks_for_operation(intent.op_id)
                        .await?
                        .into_iter()
                        .find(|b| &b.tx_data.data.payload == payload);
                    if let Some(block) = existing {
                        intent.tx_hashes.insert(*slot, block.tx_hash);
                        return Ok(());
                    }
                }

                let mut tx =
                    Transaction::create(TxData::for_operation(intent.op_id, payload.clone()))?;
                if let Some(link) = link_to {
                    tx.set_previous_hash(slot_hash(intent, *link)?)?;
                }
                let hash = tx.hash.clone();
                self.chain.append(tx).await?;
                intent.tx_hashes.insert(*slot, hash);
            }

            Step::ManufacturerLedger {
                manufacturer_id,
                change,
            } => {
                let ledgers = self.ledgers.clone();
                let manufacturer_id = manufacturer_id.clone();
                let change = change.clone();
                blocking(move || {
                    ledgers.with_manufacturer(&manufacturer_id, |l| l.apply(&change))
                })
                .await?;
            }

            Step::CommonLedger { change } => {
                let ledgers = self.ledgers.clone();
                let change = change.clone();
                blocking(move || ledgers.with_common(|c| c.apply(&change))).await?;
            }

            Step::StoreInsert {
                table,
                row,
                tx_slot,
            } => {
                let row = with_tx_id(intent, row.clone(), *tx_slot)?;
                if replay {
                    if let Some(id) = table.row_id(&row) {
                        let existing = self
                            .store
                            .select(*table, table.primary_key(), &eq(table.primary_key(), id))
                            .await?;
                        if !existing.is_empty() {
                            return Ok(());
                        }
                    }
                }
                self.store.insert(*table, row).await?;
            }

            Step::StoreUpdate {
                table,
                id,
                patch,
                tx_slot,
            } => {
                let patch = with_tx_id(intent, patch.clone(), *tx_slot)?;
                self.store.update(*table, id, patch).await?;
            }
        }

        Ok(())
    }
}

/// Run ledger file IO on the blocking pool
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> Result<T> + Send + 'static) -> Result<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Concurrency(format!("ledger write task failed: {}", e)))?
}

enum Subject<'a> {
    Drug(&'a str),
    Shipment(&'a str),
}

fn drug_key(drug_id: &str) -> String {
    format!("drug:{}", drug_id)
}

fn shipment_key(shipment_id: &str) -> String {
    format!("shipment:{}", shipment_id)
}

fn lock_keys(intent: &Intent) -> Vec<String> {
    intent
        .steps
        .iter()
        .filter_map(|step| match step {
            Step::Chain { payload, .. } => Some(match payload {
                TxPayload::ShipmentCreate { .. } | TxPayload::ShipmentUpdate { .. } => {
                    shipment_key(payload.subject_id())
                }
                _ => drug_key(payload.subject_id()),
            }),
            _ => None,
        })
        .collect()
}

fn patch<const N: usize>(pairs: [(&str, Value); N]) -> Row {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect()
}

fn status_update_row(
    op_id: Uuid,
    index: usize,
    subject: Subject<'_>,
    status: &str,
    location: &str,
    updated_by: &str,
    timestamp: DateTime<Utc>,
) -> Result<Row> {
    let (drug_id, shipment_id) = match subject {
        Subject::Drug(id) => (Some(id.to_string()), None),
        Subject::Shipment(id) => (None, Some(id.to_string())),
    };
    to_row(&StatusUpdateRow {
        id: format!("{}-{}", op_id, index),
        drug_id,
        shipment_id,
        status: status.to_string(),
        location: location.to_string(),
        updated_by: updated_by.to_string(),
        blockchain_tx_id: String::new(),
        timestamp,
    })
}

fn slot_hash(intent: &Intent, slot: usize) -> Result<String> {
    intent
        .tx_hash(slot)
        .map(str::to_string)
        .ok_or_else(|| Error::Other(format!("chain slot {} not recorded for {}", slot, intent.op_id)))
}

fn with_tx_id(intent: &Intent, mut row: Row, tx_slot: Option<usize>) -> Result<Row> {
    if let Some(slot) = tx_slot {
        row.insert(TX_ID_COLUMN.to_string(), Value::String(slot_hash(intent, slot)?));
    }
    Ok(row)
}
