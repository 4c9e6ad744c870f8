//! Anchoring external-store rows on the chain
//!
//! A row is anchored once it carries a finalized `blockchain_tx_id`. Rows
//! without one get a chain transaction built from their typed contents, and
//! the hash is written back to the store. Callers hold the record lock from
//! [`Anchor::lock_record`] around [`Anchor::anchor`].

use crate::metrics::SyncMetrics;
use crate::{Error, Result};
use dashmap::DashMap;
use provenance_ledger::external::{
    eq, from_row, is_finalized_tx, DrugRow, ShipmentRow, StatusUpdateRow, TX_ID_COLUMN,
};
use provenance_ledger::locks::{KeyedGuard, KeyedLocks};
use provenance_ledger::{
    DrugStatus, LedgerManager, Row, ShipmentStatus, Table, Transaction, TxData, TxPayload,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// Result of anchoring one row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Anchored {
    /// Chain transaction for the row
    pub tx_hash: String,
    /// Whether the transaction was appended by this node
    pub created: bool,
}

/// Row anchoring shared by the sync engine and webhook ingest
pub struct Anchor {
    manager: Arc<LedgerManager>,
    locks: KeyedLocks,
    // Hashes appended but not yet written back, by "{table}:{id}"
    pending: DashMap<String, String>,
    metrics: SyncMetrics,
}

impl std::fmt::Debug for Anchor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Anchor")
            .field("pending_write_backs", &self.pending.len())
            .finish()
    }
}

impl Anchor {
    /// New anchor over `manager`'s chain and store
    pub fn new(manager: Arc<LedgerManager>, metrics: SyncMetrics) -> Self {
        Self {
            manager,
            locks: KeyedLocks::new(),
            pending: DashMap::new(),
            metrics,
        }
    }

    /// Ledger manager
    pub fn manager(&self) -> &Arc<LedgerManager> {
        &self.manager
    }

    /// Serialize work on one record
    pub async fn lock_record(&self, table: Table, id: &str) -> KeyedGuard {
        self.locks.lock(&format!("{}:{}", table, id)).await
    }

    /// Ensure `row` has a finalized chain transaction
    pub async fn anchor(&self, table: Table, id: &str, row: &Row) -> Result<Anchored> {
        if let Some(tx_hash) = finalized_tx(row) {
            return Ok(Anchored {
                tx_hash,
                created: false,
            });
        }

        let key = format!("{}:{}", table, id);
        let store = self.manager.store();

        // The store may already be ahead of the row we were handed
        let current = store
            .select(table, TX_ID_COLUMN, &eq(table.primary_key(), id))
            .await?
            .into_iter()
            .next();
        if let Some(tx_hash) = current.as_ref().and_then(finalized_tx) {
            self.pending.remove(&key);
            return Ok(Anchored {
                tx_hash,
                created: false,
            });
        }

        let retried = self.pending.get(&key).map(|h| h.value().clone());
        let tx_hash = match retried {
            Some(hash) => hash,
            None => {
                let tx = Transaction::create(TxData::new(payload_for(table, row)?))?;
                let hash = tx.hash.clone();
                let height = self.manager.chain().append(tx).await?;
                self.pending.insert(key.clone(), hash.clone());
                self.metrics.records_anchored_total.inc();
                info!(table = %table, id, tx_hash = %hash, block_height = height, "Row anchored");
                hash
            }
        };

        if current.is_some() {
            let mut patch = Row::new();
            patch.insert(TX_ID_COLUMN.to_string(), Value::String(tx_hash.clone()));
            store.update(table, id, patch).await?;
        } else {
            debug!(table = %table, id, "Row absent from store; write-back skipped");
        }
        self.pending.remove(&key);

        Ok(Anchored {
            tx_hash,
            created: true,
        })
    }

    /// Write an existing chain id to the store row
    ///
    /// Rows that are absent or already finalized are left alone. Returns
    /// whether the row was updated.
    pub async fn write_back(&self, table: Table, id: &str, tx_hash: &str) -> Result<bool> {
        let store = self.manager.store();
        let current = store
            .select(table, TX_ID_COLUMN, &eq(table.primary_key(), id))
            .await?
            .into_iter()
            .next();
        match current {
            Some(row) if finalized_tx(&row).is_none() => {
                let mut patch = Row::new();
                patch.insert(TX_ID_COLUMN.to_string(), Value::String(tx_hash.to_string()));
                store.update(table, id, patch).await?;
                self.pending.remove(&format!("{}:{}", table, id));
                debug!(table = %table, id, tx_hash, "Known transaction written back");
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

/// Finalized chain id carried by `row`, if any
pub fn finalized_tx(row: &Row) -> Option<String> {
    row.get(TX_ID_COLUMN)
        .and_then(Value::as_str)
        .filter(|tx| is_finalized_tx(Some(*tx)))
        .map(str::to_string)
}

/// Chain payload describing a store row
pub fn payload_for(table: Table, row: &Row) -> Result<TxPayload> {
    let invalid = |e: provenance_ledger::Error| Error::InvalidPayload(format!("{} row: {}", table, e));

    let payload = match table {
        Table::Drugs => {
            let drug: DrugRow = from_row(row.clone()).map_err(invalid)?;
            TxPayload::DrugCreate {
                drug_id: drug.drug_id,
                manufacturer_id: drug.manufacturer_id,
                name: drug.name,
                description: drug.description,
                verification_hash: Some(drug.verification_hash).filter(|h| !h.is_empty()),
                created_at: drug.created_at,
            }
        }
        Table::Shipments => {
            let shipment: ShipmentRow = from_row(row.clone()).map_err(invalid)?;
            TxPayload::ShipmentCreate {
                shipment_id: shipment.shipment_id,
                drug_id: shipment.drug_id,
                manufacturer_id: shipment.manufacturer_id,
                distributor_id: shipment.distributor_id,
                created_at: shipment.created_at,
            }
        }
        Table::DrugStatusUpdates => {
            let update: StatusUpdateRow = from_row(row.clone()).map_err(invalid)?;
            TxPayload::DrugUpdate {
                drug_id: update
                    .drug_id
                    .ok_or_else(|| Error::InvalidPayload("status update without drug_id".into()))?,
                status: update.status.parse::<DrugStatus>().map_err(invalid)?,
                updated_by: update.updated_by,
                updated_at: update.timestamp,
            }
        }
        Table::ShipmentStatusUpdates => {
            let update: StatusUpdateRow = from_row(row.clone()).map_err(invalid)?;
            TxPayload::ShipmentUpdate {
                shipment_id: update.shipment_id.ok_or_else(|| {
                    Error::InvalidPayload("status update without shipment_id".into())
                })?,
                status: update.status.parse::<ShipmentStatus>().map_err(invalid)?,
                updated_by: update.updated_by,
                updated_at: update.timestamp,
            }
        }
    };

    payload.validate().map_err(invalid)?;
    Ok(payload)
}
