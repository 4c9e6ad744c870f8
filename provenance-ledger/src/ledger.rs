//! Manufacturer and common ledgers
//!
//! A [`ManufacturerLedger`] holds the drugs and shipments of one manufacturer.
//! The [`CommonLedger`] aggregates the same records across all manufacturers,
//! extended with the manufacturer, distributor and verification hash.
//!
//! # Invariants
//!
//! - `drug_id` / `shipment_id` unique within a ledger
//! - Every status change appends exactly one [`Status`] and refreshes `last_updated`
//! - History entries are never mutated or removed

use crate::types::{DrugStatus, ShipmentStatus, Status};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// History detail for a new drug
pub const DRUG_CREATED: &str = "Drug created";

/// History detail for a new shipment
pub const SHIPMENT_CREATED: &str = "Shipment created";

/// Drug state as seen by one manufacturer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugRecord {
    /// Drug ID
    pub drug_id: String,
    /// Status at creation or last full transition
    pub status: DrugStatus,
    /// Latest status
    pub current_status: DrugStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Set once the drug is reverted
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
    /// Ordered status history
    pub history: Vec<Status>,
}

impl DrugRecord {
    fn new(drug_id: &str, status: DrugStatus, entry: Status) -> Self {
        Self {
            drug_id: drug_id.to_string(),
            status,
            current_status: status,
            created_at: entry.timestamp,
            reverted_at: None,
            history: vec![entry],
        }
    }

    fn record(&mut self, status: DrugStatus, entry: Status) {
        if status == DrugStatus::Reverted {
            self.reverted_at = Some(entry.timestamp);
        }
        self.status = status;
        self.current_status = status;
        self.history.push(entry);
    }
}

/// Shipment state as seen by one manufacturer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShipmentRecord {
    /// Shipment ID
    pub shipment_id: String,
    /// Drug carried
    pub drug_id: String,
    /// Status at creation or last full transition
    pub status: ShipmentStatus,
    /// Latest status
    pub current_status: ShipmentStatus,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Ordered status history
    pub history: Vec<Status>,
}

impl ShipmentRecord {
    fn new(shipment_id: &str, drug_id: &str, status: ShipmentStatus, entry: Status) -> Self {
        Self {
            shipment_id: shipment_id.to_string(),
            drug_id: drug_id.to_string(),
            status,
            current_status: status,
            created_at: entry.timestamp,
            history: vec![entry],
        }
    }

    fn record(&mut self, status: ShipmentStatus, entry: Status) {
        self.status = status;
        self.current_status = status;
        self.history.push(entry);
    }
}

/// Change to apply to both ledgers, replay-safe
///
/// Applying a change that is already present (same creation time, or same
/// last history entry) is a no-op, so an interrupted operation can be
/// replayed without duplicating history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum LedgerChange {
    /// Register a drug in `created` state
    AddDrug {
        /// Drug ID
        drug_id: String,
        /// Owning manufacturer
        manufacturer_id: String,
        /// Verification hash (common ledger only)
        verification_hash: String,
        /// Initial history entry
        entry: Status,
    },
    /// Register a shipment in `created` state
    AddShipment {
        /// Shipment ID
        shipment_id: String,
        /// Drug carried
        drug_id: String,
        /// Shipping manufacturer
        manufacturer_id: String,
        /// Receiving distributor (common ledger only)
        distributor_id: String,
        /// Initial history entry
        entry: Status,
    },
    /// Move a drug to a new status
    DrugStatus {
        /// Drug ID
        drug_id: String,
        /// New status
        status: DrugStatus,
        /// History entry
        entry: Status,
    },
    /// Move a shipment to a new status
    ShipmentStatus {
        /// Shipment ID
        shipment_id: String,
        /// New status
        status: ShipmentStatus,
        /// History entry
        entry: Status,
    },
}

/// Per-manufacturer ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManufacturerLedger {
    /// Owning manufacturer
    pub manufacturer_id: String,
    /// Drugs
    pub drugs: Vec<DrugRecord>,
    /// Shipments
    pub shipments: Vec<ShipmentRecord>,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl ManufacturerLedger {
    /// Empty ledger
    pub fn new(manufacturer_id: impl Into<String>) -> Self {
        Self {
            manufacturer_id: manufacturer_id.into(),
            drugs: Vec::new(),
            shipments: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Get a drug
    pub fn drug(&self, drug_id: &str) -> Option<&DrugRecord> {
        self.drugs.iter().find(|d| d.drug_id == drug_id)
    }

    /// Get a shipment
    pub fn shipment(&self, shipment_id: &str) -> Option<&ShipmentRecord> {
        self.shipments.iter().find(|s| s.shipment_id == shipment_id)
    }

    /// Add a drug with an initial status
    pub fn add_drug(&mut self, drug_id: &str, status: DrugStatus) -> Result<()> {
        let entry = Status::new(status.as_str(), Utc::now(), DRUG_CREATED);
        self.insert_drug(DrugRecord::new(drug_id, status, entry))
    }

    /// Append a drug status transition
    pub fn update_drug_status(&mut self, drug_id: &str, new_status: DrugStatus, details: &str) -> Result<()> {
        let entry = Status::new(new_status.as_str(), Utc::now(), details);
        self.record_drug(drug_id, new_status, entry)
    }

    /// Add a shipment with an initial status
    pub fn add_shipment(&mut self, shipment_id: &str, drug_id: &str, status: ShipmentStatus) -> Result<()> {
        let entry = Status::new(status.as_str(), Utc::now(), SHIPMENT_CREATED);
        self.insert_shipment(ShipmentRecord::new(shipment_id, drug_id, status, entry))
    }

    /// Append a shipment status transition
    pub fn update_shipment_status(
        &mut self,
        shipment_id: &str,
        new_status: ShipmentStatus,
        details: &str,
    ) -> Result<()> {
        let entry = Status::new(new_status.as_str(), Utc::now(), details);
        self.record_shipment(shipment_id, new_status, entry)
    }

    /// Full drug history
    pub fn drug_history(&self, drug_id: &str) -> Result<Vec<Status>> {
        self.drug(drug_id)
            .map(|d| d.history.clone())
            .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))
    }

    /// Full shipment history
    pub fn shipment_history(&self, shipment_id: &str) -> Result<Vec<Status>> {
        self.shipment(shipment_id)
            .map(|s| s.history.clone())
            .ok_or_else(|| Error::ShipmentNotFound(shipment_id.to_string()))
    }

    /// Apply a change; returns `false` if it was already present
    pub fn apply(&mut self, change: &LedgerChange) -> Result<bool> {
        match change {
            LedgerChange::AddDrug { drug_id, entry, .. } => {
                if let Some(existing) = self.drug(drug_id) {
                    return already_added("drug", drug_id, existing.created_at, entry);
                }
                self.insert_drug(DrugRecord::new(drug_id, DrugStatus::Created, entry.clone()))?;
            }
            LedgerChange::AddShipment {
                shipment_id,
                drug_id,
                entry,
                ..
            } => {
                if let Some(existing) = self.shipment(shipment_id) {
                    return already_added("shipment", shipment_id, existing.created_at, entry);
                }
                self.insert_shipment(ShipmentRecord::new(
                    shipment_id,
                    drug_id,
                    ShipmentStatus::Created,
                    entry.clone(),
                ))?;
            }
            LedgerChange::DrugStatus {
                drug_id,
                status,
                entry,
            } => {
                let record = self
                    .drug(drug_id)
                    .ok_or_else(|| Error::DrugNotFound(drug_id.clone()))?;
                if record.history.last() == Some(entry) {
                    return Ok(false);
                }
                self.record_drug(drug_id, *status, entry.clone())?;
            }
            LedgerChange::ShipmentStatus {
                shipment_id,
                status,
                entry,
            } => {
                let record = self
                    .shipment(shipment_id)
                    .ok_or_else(|| Error::ShipmentNotFound(shipment_id.clone()))?;
                if record.history.last() == Some(entry) {
                    return Ok(false);
                }
                self.record_shipment(shipment_id, *status, entry.clone())?;
            }
        }
        Ok(true)
    }

    fn insert_drug(&mut self, record: DrugRecord) -> Result<()> {
        if self.drug(&record.drug_id).is_some() {
            return Err(Error::Conflict(format!(
                "drug {} already exists in ledger",
                record.drug_id
            )));
        }
        self.drugs.push(record);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn insert_shipment(&mut self, record: ShipmentRecord) -> Result<()> {
        if self.shipment(&record.shipment_id).is_some() {
            return Err(Error::Conflict(format!(
                "shipment {} already exists in ledger",
                record.shipment_id
            )));
        }
        self.shipments.push(record);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn record_drug(&mut self, drug_id: &str, status: DrugStatus, entry: Status) -> Result<()> {
        let record = self
            .drugs
            .iter_mut()
            .find(|d| d.drug_id == drug_id)
            .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))?;
        record.record(status, entry);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn record_shipment(&mut self, shipment_id: &str, status: ShipmentStatus, entry: Status) -> Result<()> {
        let record = self
            .shipments
            .iter_mut()
            .find(|s| s.shipment_id == shipment_id)
            .ok_or_else(|| Error::ShipmentNotFound(shipment_id.to_string()))?;
        record.record(status, entry);
        self.last_updated = Utc::now();
        Ok(())
    }
}

/// Drug record in the common ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonDrugRecord {
    /// Manufacturer-scoped fields
    #[serde(flatten)]
    pub record: DrugRecord,
    /// Owning manufacturer
    pub manufacturer_id: String,
    /// Verification hash issued at creation
    pub verification_hash: String,
}

/// Shipment record in the common ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonShipmentRecord {
    /// Manufacturer-scoped fields
    #[serde(flatten)]
    pub record: ShipmentRecord,
    /// Shipping manufacturer
    pub manufacturer_id: String,
    /// Receiving distributor
    pub distributor_id: String,
}

/// Cross-manufacturer ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonLedger {
    /// Drugs of all manufacturers
    pub drugs: Vec<CommonDrugRecord>,
    /// Shipments of all manufacturers
    pub shipments: Vec<CommonShipmentRecord>,
    /// Last mutation time
    pub last_updated: DateTime<Utc>,
}

impl Default for CommonLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl CommonLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self {
            drugs: Vec::new(),
            shipments: Vec::new(),
            last_updated: Utc::now(),
        }
    }

    /// Get a drug
    pub fn drug(&self, drug_id: &str) -> Option<&CommonDrugRecord> {
        self.drugs.iter().find(|d| d.record.drug_id == drug_id)
    }

    /// Get a shipment
    pub fn shipment(&self, shipment_id: &str) -> Option<&CommonShipmentRecord> {
        self.shipments
            .iter()
            .find(|s| s.record.shipment_id == shipment_id)
    }

    /// Add a drug with an initial status
    pub fn add_drug(
        &mut self,
        drug_id: &str,
        status: DrugStatus,
        manufacturer_id: &str,
        verification_hash: &str,
    ) -> Result<()> {
        let entry = Status::new(status.as_str(), Utc::now(), DRUG_CREATED);
        self.insert_drug(CommonDrugRecord {
            record: DrugRecord::new(drug_id, status, entry),
            manufacturer_id: manufacturer_id.to_string(),
            verification_hash: verification_hash.to_string(),
        })
    }

    /// Append a drug status transition
    pub fn update_drug_status(&mut self, drug_id: &str, new_status: DrugStatus, details: &str) -> Result<()> {
        let entry = Status::new(new_status.as_str(), Utc::now(), details);
        self.record_drug(drug_id, new_status, entry)
    }

    /// Add a shipment with an initial status
    pub fn add_shipment(
        &mut self,
        shipment_id: &str,
        drug_id: &str,
        status: ShipmentStatus,
        manufacturer_id: &str,
        distributor_id: &str,
    ) -> Result<()> {
        let entry = Status::new(status.as_str(), Utc::now(), SHIPMENT_CREATED);
        self.insert_shipment(CommonShipmentRecord {
            record: ShipmentRecord::new(shipment_id, drug_id, status, entry),
            manufacturer_id: manufacturer_id.to_string(),
            distributor_id: distributor_id.to_string(),
        })
    }

    /// Append a shipment status transition
    pub fn update_shipment_status(
        &mut self,
        shipment_id: &str,
        new_status: ShipmentStatus,
        details: &str,
    ) -> Result<()> {
        let entry = Status::new(new_status.as_str(), Utc::now(), details);
        self.record_shipment(shipment_id, new_status, entry)
    }

    /// Full drug history
    pub fn drug_history(&self, drug_id: &str) -> Result<Vec<Status>> {
        self.drug(drug_id)
            .map(|d| d.record.history.clone())
            .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))
    }

    /// Full shipment history
    pub fn shipment_history(&self, shipment_id: &str) -> Result<Vec<Status>> {
        self.shipment(shipment_id)
            .map(|s| s.record.history.clone())
            .ok_or_else(|| Error::ShipmentNotFound(shipment_id.to_string()))
    }

    /// Shipments addressed to a distributor
    pub fn distributor_shipments(&self, distributor_id: &str) -> Vec<CommonShipmentRecord> {
        self.shipments
            .iter()
            .filter(|s| s.distributor_id == distributor_id)
            .cloned()
            .collect()
    }

    /// Apply a change; returns `false` if it was already present
    pub fn apply(&mut self, change: &LedgerChange) -> Result<bool> {
        match change {
            LedgerChange::AddDrug {
                drug_id,
                manufacturer_id,
                verification_hash,
                entry,
            } => {
                if let Some(existing) = self.drug(drug_id) {
                    return already_added("drug", drug_id, existing.record.created_at, entry);
                }
                self.insert_drug(CommonDrugRecord {
                    record: DrugRecord::new(drug_id, DrugStatus::Created, entry.clone()),
                    manufacturer_id: manufacturer_id.clone(),
                    verification_hash: verification_hash.clone(),
                })?;
            }
            LedgerChange::AddShipment {
                shipment_id,
                drug_id,
                manufacturer_id,
                distributor_id,
                entry,
            } => {
                if let Some(existing) = self.shipment(shipment_id) {
                    return already_added("shipment", shipment_id, existing.record.created_at, entry);
                }
                self.insert_shipment(CommonShipmentRecord {
                    record: ShipmentRecord::new(
                        shipment_id,
                        drug_id,
                        ShipmentStatus::Created,
                        entry.clone(),
                    ),
                    manufacturer_id: manufacturer_id.clone(),
                    distributor_id: distributor_id.clone(),
                })?;
            }
            LedgerChange::DrugStatus {
                drug_id,
                status,
                entry,
            } => {
                let record = self
                    .drug(drug_id)
                    .ok_or_else(|| Error::DrugNotFound(drug_id.clone()))?;
                if record.record.history.last() == Some(entry) {
                    return Ok(false);
                }
                self.record_drug(drug_id, *status, entry.clone())?;
            }
            LedgerChange::ShipmentStatus {
                shipment_id,
                status,
                entry,
            } => {
                let record = self
                    .shipment(shipment_id)
                    .ok_or_else(|| Error::ShipmentNotFound(shipment_id.clone()))?;
                if record.record.history.last() == Some(entry) {
                    return Ok(false);
                }
                self.record_shipment(shipment_id, *status, entry.clone())?;
            }
        }
        Ok(true)
    }

    fn insert_drug(&mut self, record: CommonDrugRecord) -> Result<()> {
        if self.drug(&record.record.drug_id).is_some() {
            return Err(Error::Conflict(format!(
                "drug {} already exists in common ledger",
                record.record.drug_id
            )));
        }
        self.drugs.push(record);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn insert_shipment(&mut self, record: CommonShipmentRecord) -> Result<()> {
        if self.shipment(&record.record.shipment_id).is_some() {
            return Err(Error::Conflict(format!(
                "shipment {} already exists in common ledger",
                record.record.shipment_id
            )));
        }
        self.shipments.push(record);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn record_drug(&mut self, drug_id: &str, status: DrugStatus, entry: Status) -> Result<()> {
        let record = self
            .drugs
            .iter_mut()
            .find(|d| d.record.drug_id == drug_id)
            .ok_or_else(|| Error::DrugNotFound(drug_id.to_string()))?;
        record.record.record(status, entry);
        self.last_updated = Utc::now();
        Ok(())
    }

    fn record_shipment(&mut self, shipment_id: &str, status: ShipmentStatus, entry: Status) -> Result<()> {
        let record = self
            .shipments
            .iter_mut()
            .find(|s| s.record.shipment_id == shipment_id)
            .ok_or_else(|| Error::ShipmentNotFound(shipment_id.to_string()))?;
        record.record.record(status, entry);
        self.last_updated = Utc::now();
        Ok(())
    }
}

fn already_added(kind: &str, id: &str, created_at: DateTime<Utc>, entry: &Status) -> Result<bool> {
    if created_at == entry.timestamp {
        Ok(false)
    } else {
        Err(Error::Conflict(format!("{} {} already exists in ledger", kind, id)))
    }
}
