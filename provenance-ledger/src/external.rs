//! External relational store interface
//!
//! The store is an opaque, eventually consistent keyed document store with no
//! transactions. The ledger only needs four calls: select, insert, update and
//! delete. [`MemoryStore`] is an in-process implementation used for local
//! runs and tests.

use crate::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// A store row
pub type Row = Map<String, Value>;

/// Equality filter: every `(column, value)` pair must match
pub type Filter = Vec<(String, Value)>;

/// Sentinel chain-transaction id for rows not yet anchored
pub const PENDING_TX: &str = "pending";

/// Column holding a row's chain-transaction id
pub const TX_ID_COLUMN: &str = "blockchain_tx_id";

/// Whether a recorded chain-transaction id is final
pub fn is_finalized_tx(tx_id: Option<&str>) -> bool {
    matches!(tx_id, Some(id) if !id.is_empty() && id != PENDING_TX)
}

/// Store tables used by the ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    /// Drug rows
    Drugs,
    /// Drug status history rows
    DrugStatusUpdates,
    /// Shipment rows
    Shipments,
    /// Shipment status history rows
    ShipmentStatusUpdates,
}

impl Table {
    /// Table name
    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Drugs => "drugs",
            Table::DrugStatusUpdates => "drug_status_updates",
            Table::Shipments => "shipments",
            Table::ShipmentStatusUpdates => "shipment_status_updates",
        }
    }

    /// Primary key column
    pub fn primary_key(&self) -> &'static str {
        match self {
            Table::Drugs => "drug_id",
            Table::Shipments => "shipment_id",
            Table::DrugStatusUpdates | Table::ShipmentStatusUpdates => "id",
        }
    }

    /// Primary key value of `row`, if present and non-empty
    pub fn row_id(&self, row: &Row) -> Option<String> {
        match row.get(self.primary_key()) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        }
    }

    fn not_found(&self, id: &str) -> Error {
        match self {
            Table::Drugs => Error::DrugNotFound(id.to_string()),
            Table::Shipments => Error::ShipmentNotFound(id.to_string()),
            other => Error::Other(format!("{} row {} not found", other, id)),
        }
    }
}

impl fmt::Display for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Table {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drugs" => Ok(Table::Drugs),
            "drug_status_updates" => Ok(Table::DrugStatusUpdates),
            "shipments" => Ok(Table::Shipments),
            "shipment_status_updates" => Ok(Table::ShipmentStatusUpdates),
            other => Err(Error::Validation(format!("unhandled table: {}", other))),
        }
    }
}

/// External store client
#[async_trait]
pub trait ExternalStore: Send + Sync {
    /// Rows of `table` matching `filter`, restricted to `projection` ("*" for all columns)
    async fn select(&self, table: Table, projection: &str, filter: &Filter) -> Result<Vec<Row>>;

    /// Insert a row and return it as stored
    async fn insert(&self, table: Table, row: Row) -> Result<Row>;

    /// Merge `patch` into the row with primary key `id`
    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row>;

    /// Delete the rows matching `filter` and return the first one
    async fn delete(&self, table: Table, filter: &Filter) -> Result<Row>;
}

/// Serialize a typed row
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
    match serde_json::to_value(value)? {
        Value::Object(map) => Ok(map),
        other => Err(Error::Validation(format!("row must be an object, got {}", other))),
    }
}

/// Deserialize a typed row
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
    serde_json::from_value(Value::Object(row))
        .map_err(|e| Error::Validation(format!("malformed row: {}", e)))
}

/// Filter on a single column
pub fn eq(column: &str, value: impl Into<Value>) -> Filter {
    vec![(column.to_string(), value.into())]
}

/// `drugs` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DrugRow {
    /// Drug ID
    pub drug_id: String,
    /// Owning manufacturer
    pub manufacturer_id: String,
    /// Product name
    pub name: String,
    /// Product description
    #[serde(default)]
    pub description: String,
    /// Current status
    pub status: String,
    /// Verification hash
    #[serde(default)]
    pub verification_hash: String,
    /// Latest chain transaction, "" or "pending" until anchored
    #[serde(default)]
    pub blockchain_tx_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
    /// Reversion time
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverted_at: Option<DateTime<Utc>>,
}

/// `shipments` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShipmentRow {
    /// Shipment ID
    pub shipment_id: String,
    /// Drug carried
    pub drug_id: String,
    /// Shipping manufacturer
    pub manufacturer_id: String,
    /// Receiving distributor
    pub distributor_id: String,
    /// Current status
    pub status: String,
    /// Latest chain transaction, "" or "pending" until anchored
    #[serde(default)]
    pub blockchain_tx_id: String,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last change
    pub updated_at: DateTime<Utc>,
}

/// `drug_status_updates` / `shipment_status_updates` row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdateRow {
    /// Row ID
    pub id: String,
    /// Drug this update belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drug_id: Option<String>,
    /// Shipment this update belongs to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shipment_id: Option<String>,
    /// New status
    pub status: String,
    /// Where it happened
    #[serde(default)]
    pub location: String,
    /// Acting user
    #[serde(default)]
    pub updated_by: String,
    /// Chain transaction recording the change
    #[serde(default)]
    pub blockchain_tx_id: String,
    /// When it happened
    pub timestamp: DateTime<Utc>,
}

/// In-process store
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: RwLock<HashMap<Table, Vec<Row>>>,
    failures: RwLock<HashMap<Table, usize>>,
}

impl MemoryStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `times` writes to `table` with a transient error
    pub fn fail_writes(&self, table: Table, times: usize) {
        self.failures.write().insert(table, times);
    }

    /// Number of rows in `table`
    pub fn len(&self, table: Table) -> usize {
        self.tables.read().get(&table).map_or(0, Vec::len)
    }

    /// Whether `table` is empty
    pub fn is_empty(&self, table: Table) -> bool {
        self.len(table) == 0
    }

    fn take_failure(&self, table: Table) -> Result<()> {
        let mut failures = self.failures.write();
        if let Some(remaining) = failures.get_mut(&table) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(Error::ExternalStore(format!(
                    "injected write failure on {}",
                    table
                )));
            }
        }
        Ok(())
    }
}

fn row_matches(row: &Row, filter: &Filter) -> bool {
    filter
        .iter()
        .all(|(column, value)| row.get(column) == Some(value))
}

fn project(row: &Row, projection: &str) -> Row {
    if projection.trim() == "*" {
        return row.clone();
    }
    projection
        .split(',')
        .map(str::trim)
        .filter_map(|column| row.get(column).map(|v| (column.to_string(), v.clone())))
        .collect()
}

#[async_trait]
impl ExternalStore for MemoryStore {
    async fn select(&self, table: Table, projection: &str, filter: &Filter) -> Result<Vec<Row>> {
        let tables = self.tables.read();
        Ok(tables
            .get(&table)
            .map(|rows| {
                rows.iter()
                    .filter(|row| row_matches(row, filter))
                    .map(|row| project(row, projection))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn insert(&self, table: Table, mut row: Row) -> Result<Row> {
        self.take_failure(table)?;

        let key = table.primary_key();
        let id = match table.row_id(&row) {
            Some(id) => id,
            None if key == "id" => {
                let id = uuid::Uuid::new_v4().to_string();
                row.insert(key.to_string(), Value::String(id.clone()));
                id
            }
            None => {
                return Err(Error::Validation(format!(
                    "{} row is missing {}",
                    table, key
                )))
            }
        };

        let mut tables = self.tables.write();
        let rows = tables.entry(table).or_default();
        if rows.iter().any(|r| table.row_id(r).as_deref() == Some(id.as_str())) {
            return Err(Error::Conflict(format!("{} row {} already exists", table, id)));
        }
        rows.push(row.clone());
        Ok(row)
    }

    async fn update(&self, table: Table, id: &str, patch: Row) -> Result<Row> {
        self.take_failure(table)?;

        let mut tables = self.tables.write();
        let row = tables
            .get_mut(&table)
            .and_then(|rows| {
                rows.iter_mut()
                    .find(|r| table.row_id(r).as_deref() == Some(id))
            })
            .ok_or_else(|| table.not_found(id))?;

        for (column, value) in patch {
            row.insert(column, value);
        }
        Ok(row.clone())
    }

    async fn delete(&self, table: Table, filter: &Filter) -> Result<Row> {
        self.take_failure(table)?;

        let mut tables = self.tables.write();
        let rows = tables.entry(table).or_default();
        let (removed, kept): (Vec<Row>, Vec<Row>) =
            rows.drain(..).partition(|row| row_matches(row, filter));
        *rows = kept;

        removed
            .into_iter()
            .next()
            .ok_or_else(|| Error::Other(format!("no {} rows matched delete filter", table)))
    }
}
