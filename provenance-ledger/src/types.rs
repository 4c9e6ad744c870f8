//! Core types for the provenance ledger
//!
//! All types are designed for:
//! - Deterministic JSON serialization (chain hashing, ledger files)
//! - Closed state sets for drugs and shipments
//! - One payload shape per chain transaction type

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Lifecycle state of a drug
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DrugStatus {
    /// Registered by its manufacturer
    Created,
    /// Attached to at least one shipment
    InTransit,
    /// Delivered via a shipment (terminal)
    Delivered,
    /// Recalled or withdrawn (terminal)
    Reverted,
}

impl DrugStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            DrugStatus::Created => "created",
            DrugStatus::InTransit => "in_transit",
            DrugStatus::Delivered => "delivered",
            DrugStatus::Reverted => "reverted",
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, DrugStatus::Delivered | DrugStatus::Reverted)
    }

    /// Whether `next` is reachable from this state
    ///
    /// A drug may ride several shipments, so `in_transit -> in_transit` is allowed.
    pub fn can_transition_to(&self, next: DrugStatus) -> bool {
        use DrugStatus::*;
        matches!(
            (self, next),
            (Created, InTransit)
                | (Created, Reverted)
                | (InTransit, InTransit)
                | (InTransit, Delivered)
                | (InTransit, Reverted)
        )
    }

    /// Fail with `InvalidTransition` unless `next` is reachable
    pub fn ensure_transition(&self, next: DrugStatus) -> Result<()> {
        if self.can_transition_to(next) {
            Ok(())
        } else {
            Err(Error::InvalidTransition {
                entity: "drug",
                from: self.to_string(),
                to: next.to_string(),
            })
        }
    }
}

impl fmt::Display for DrugStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DrugStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(DrugStatus::Created),
            "in_transit" => Ok(DrugStatus::InTransit),
            "delivered" => Ok(DrugStatus::Delivered),
            "reverted" => Ok(DrugStatus::Reverted),
            other => Err(Error::Validation(format!("unknown drug status: {}", other))),
        }
    }
}

/// Lifecycle state of a shipment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShipmentStatus {
    /// Registered, not yet moving
    Created,
    /// Picked up by the carrier
    InTransit,
    /// Received by the distributor (terminal)
    Delivered,
    /// Lost, damaged or rejected (terminal)
    Failed,
}

impl ShipmentStatus {
    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            ShipmentStatus::Created => "created",
            ShipmentStatus::InTransit => "in_transit",
            ShipmentStatus::Delivered => "delivered",
            ShipmentStatus::Failed => "failed",
        }
    }

    /// Check if status is terminal
    pub fn is_terminal(&self) -> bool {
        matches!(self, ShipmentStatus::Delivered | ShipmentStatus::Failed)
    }

    /// Fail with `InvalidTransition` when leaving a terminal state
    pub fn ensure_transition(&self, next: ShipmentStatus) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidTransition {
                entity: "shipment",
                from: self.to_string(),
                to: next.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Display for ShipmentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ShipmentStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "created" => Ok(ShipmentStatus::Created),
            "in_transit" => Ok(ShipmentStatus::InTransit),
            "delivered" => Ok(ShipmentStatus::Delivered),
            "failed" => Ok(ShipmentStatus::Failed),
            other => Err(Error::Validation(format!("unknown shipment status: {}", other))),
        }
    }
}

/// One entry of a status history. Never mutated once appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Status name
    pub status: String,

    /// When the transition happened
    pub timestamp: DateTime<Utc>,

    /// Free-form context ("Drug added to shipment S1", ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Status {
    /// Create a history entry
    pub fn new(status: impl Into<String>, timestamp: DateTime<Utc>, details: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            timestamp,
            details: Some(details.into()),
        }
    }
}

/// Chain transaction payload, one variant per transaction type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tx_type", rename_all = "snake_case")]
pub enum TxPayload {
    /// A manufacturer registered a drug
    DrugCreate {
        /// Drug ID
        drug_id: String,
        /// Owning manufacturer
        manufacturer_id: String,
        /// Product name
        name: String,
        /// Product description
        #[serde(default)]
        description: String,
        /// Verification hash, absent for rows anchored by sync
        #[serde(default, skip_serializing_if = "Option::is_none")]
        verification_hash: Option<String>,
        /// Creation time
        created_at: DateTime<Utc>,
    },

    /// A drug changed status
    DrugUpdate {
        /// Drug ID
        drug_id: String,
        /// New status
        status: DrugStatus,
        /// Acting user
        updated_by: String,
        /// Transition time
        updated_at: DateTime<Utc>,
    },

    /// A shipment was registered
    ShipmentCreate {
        /// Shipment ID
        shipment_id: String,
        /// Drug carried
        drug_id: String,
        /// Shipping manufacturer
        manufacturer_id: String,
        /// Receiving distributor
        distributor_id: String,
        /// Creation time
        created_at: DateTime<Utc>,
    },

    /// A shipment changed status
    ShipmentUpdate {
        /// Shipment ID
        shipment_id: String,
        /// New status
        status: ShipmentStatus,
        /// Acting user
        updated_by: String,
        /// Transition time
        updated_at: DateTime<Utc>,
    },

    /// A drug was reverted (recall, withdrawal)
    DrugRevert {
        /// Drug ID
        drug_id: String,
        /// Reason given by the manufacturer
        reason: String,
        /// Acting user
        updated_by: String,
        /// Reversion time
        reverted_at: DateTime<Utc>,
    },
}

impl TxPayload {
    /// Transaction type tag as written to the chain
    pub fn tx_type(&self) -> &'static str {
        match self {
            TxPayload::DrugCreate { .. } => "drug_create",
            TxPayload::DrugUpdate { .. } => "drug_update",
            TxPayload::ShipmentCreate { .. } => "shipment_create",
            TxPayload::ShipmentUpdate { .. } => "shipment_update",
            TxPayload::DrugRevert { .. } => "drug_revert",
        }
    }

    /// ID of the drug or shipment this payload is about
    pub fn subject_id(&self) -> &str {
        match self {
            TxPayload::DrugCreate { drug_id, .. }
            | TxPayload::DrugUpdate { drug_id, .. }
            | TxPayload::DrugRevert { drug_id, .. } => drug_id,
            TxPayload::ShipmentCreate { shipment_id, .. }
            | TxPayload::ShipmentUpdate { shipment_id, .. } => shipment_id,
        }
    }

    /// Reject payloads with empty required fields
    pub fn validate(&self) -> Result<()> {
        match self {
            TxPayload::DrugCreate {
                drug_id,
                manufacturer_id,
                name,
                ..
            } => {
                require("drug_id", drug_id)?;
                require("manufacturer_id", manufacturer_id)?;
                require("name", name)
            }
            TxPayload::DrugUpdate { drug_id, .. } => require("drug_id", drug_id),
            TxPayload::ShipmentCreate {
                shipment_id,
                drug_id,
                manufacturer_id,
                distributor_id,
                ..
            } => {
                require("shipment_id", shipment_id)?;
                require("drug_id", drug_id)?;
                require("manufacturer_id", manufacturer_id)?;
                require("distributor_id", distributor_id)
            }
            TxPayload::ShipmentUpdate { shipment_id, .. } => require("shipment_id", shipment_id),
            TxPayload::DrugRevert {
                drug_id, reason, ..
            } => {
                require("drug_id", drug_id)?;
                require("reason", reason)
            }
        }
    }
}

/// Data hashed into a chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxData {
    /// Outbox operation that produced this transaction, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op_id: Option<Uuid>,

    /// Typed payload
    #[serde(flatten)]
    pub payload: TxPayload,
}

impl TxData {
    /// Payload not tied to an outbox operation
    pub fn new(payload: TxPayload) -> Self {
        Self {
            op_id: None,
            payload,
        }
    }

    /// Payload produced by outbox operation `op_id`
    pub fn for_operation(op_id: Uuid, payload: TxPayload) -> Self {
        Self {
            op_id: Some(op_id),
            payload,
        }
    }
}

/// Parameters for registering a drug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDrugParams {
    /// Drug ID
    pub drug_id: String,
    /// Owning manufacturer
    pub manufacturer_id: String,
    /// Product name
    pub name: String,
    /// Product description
    pub description: String,
    /// Acting user
    pub user_id: String,
    /// Where the action took place
    pub location: String,
}

impl CreateDrugParams {
    /// Reject missing required fields
    pub fn validate(&self) -> Result<()> {
        require("drug_id", &self.drug_id)?;
        require("manufacturer_id", &self.manufacturer_id)?;
        require("name", &self.name)?;
        require("user_id", &self.user_id)
    }
}

/// Parameters for registering a shipment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateShipmentParams {
    /// Shipment ID
    pub shipment_id: String,
    /// Drug carried
    pub drug_id: String,
    /// Shipping manufacturer
    pub manufacturer_id: String,
    /// Receiving distributor
    pub distributor_id: String,
    /// Acting user
    pub user_id: String,
    /// Where the action took place
    pub location: String,
}

impl CreateShipmentParams {
    /// Reject missing required fields
    pub fn validate(&self) -> Result<()> {
        require("shipment_id", &self.shipment_id)?;
        require("drug_id", &self.drug_id)?;
        require("manufacturer_id", &self.manufacturer_id)?;
        require("distributor_id", &self.distributor_id)?;
        require("user_id", &self.user_id)
    }
}

/// Parameters for a shipment status change
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateShipmentStatusParams {
    /// Shipment ID
    pub shipment_id: String,
    /// New status name, parsed into [`ShipmentStatus`]
    pub status: String,
    /// Acting user
    pub user_id: String,
    /// Where the action took place
    pub location: String,
}

impl UpdateShipmentStatusParams {
    /// Reject missing fields and unknown statuses
    pub fn validate(&self) -> Result<ShipmentStatus> {
        require("shipment_id", &self.shipment_id)?;
        require("user_id", &self.user_id)?;
        self.status.parse()
    }
}

/// Parameters for reverting a drug
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RevertDrugParams {
    /// Drug ID
    pub drug_id: String,
    /// Manufacturer requesting the revert
    pub manufacturer_id: String,
    /// Reason ("recall", ...)
    pub reason: String,
    /// Acting user
    pub user_id: String,
    /// Where the action took place
    pub location: String,
}

impl RevertDrugParams {
    /// Reject missing required fields
    pub fn validate(&self) -> Result<()> {
        require("drug_id", &self.drug_id)?;
        require("reason", &self.reason)?;
        require("user_id", &self.user_id)
    }
}

fn require(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::Validation(format!("{} is required", field)));
    }
    Ok(())
}
