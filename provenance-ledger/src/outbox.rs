//! Outbox of multi-store operation intents
//!
//! A Ledger Manager operation is planned into an [`Intent`]: an ordered list
//! of [`Step`]s covering the chain, both ledgers and the external store. The
//! intent is persisted before the first step runs and after each completed
//! step, and removed once every step succeeded. An intent still present after
//! a failure or crash is replayed from `next_step`.

use crate::external::{Row, Table};
use crate::ledger::LedgerChange;
use crate::storage::{read_json, write_json_atomic};
use crate::types::TxPayload;
use crate::{Config, Result};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

/// One idempotent unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum Step {
    /// Append a chain transaction; its hash is stored under `slot`
    Chain {
        /// Index into [`Intent::tx_hashes`]
        slot: usize,
        /// Payload to hash
        payload: TxPayload,
        /// Slot whose hash becomes this transaction's `previous_hash`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        link_to: Option<usize>,
    },

    /// Apply a change to a manufacturer ledger
    ManufacturerLedger {
        /// Ledger owner
        manufacturer_id: String,
        /// Change to apply
        change: LedgerChange,
    },

    /// Apply a change to the common ledger
    CommonLedger {
        /// Change to apply
        change: LedgerChange,
    },

    /// Insert a store row
    StoreInsert {
        /// Target table
        table: Table,
        /// Row; `blockchain_tx_id` is filled from `tx_slot`
        row: Row,
        /// Chain slot recorded on the row
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_slot: Option<usize>,
    },

    /// Patch a store row
    StoreUpdate {
        /// Target table
        table: Table,
        /// Primary key
        id: String,
        /// Columns to set; `blockchain_tx_id` is filled from `tx_slot`
        patch: Row,
        /// Chain slot recorded on the row
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tx_slot: Option<usize>,
    },
}

impl Step {
    /// Short label for logs
    pub fn label(&self) -> &'static str {
        match self {
            Step::Chain { .. } => "chain",
            Step::ManufacturerLedger { .. } => "manufacturer_ledger",
            Step::CommonLedger { .. } => "common_ledger",
            Step::StoreInsert { .. } => "store_insert",
            Step::StoreUpdate { .. } => "store_update",
        }
    }
}

/// A planned operation and its progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Intent {
    /// Operation ID, also written into every chain transaction it creates
    pub op_id: Uuid,

    /// Operation name ("create_drug", ...)
    pub operation: String,

    /// Planning time
    pub created_at: DateTime<Utc>,

    /// Ordered steps
    pub steps: Vec<Step>,

    /// Index of the first step not yet completed
    pub next_step: usize,

    /// Chain hashes by slot
    #[serde(default)]
    pub tx_hashes: BTreeMap<usize, String>,

    /// Execution attempts so far
    #[serde(default)]
    pub attempts: u32,

    /// Error of the last failed attempt
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Intent {
    /// New intent with no progress
    pub fn new(operation: impl Into<String>, op_id: Uuid, steps: Vec<Step>) -> Self {
        Self {
            op_id,
            operation: operation.into(),
            created_at: Utc::now(),
            steps,
            next_step: 0,
            tx_hashes: BTreeMap::new(),
            attempts: 0,
            last_error: None,
        }
    }

    /// Whether every step has completed
    pub fn is_complete(&self) -> bool {
        self.next_step >= self.steps.len()
    }

    /// Hash stored under a chain slot
    pub fn tx_hash(&self, slot: usize) -> Option<&str> {
        self.tx_hashes.get(&slot).map(String::as_str)
    }
}

/// Durable set of unclosed intents
#[derive(Debug)]
pub struct Outbox {
    path: PathBuf,
    intents: Mutex<BTreeMap<Uuid, Intent>>,
}

impl Outbox {
    /// Load the outbox file
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.outbox_path();
        let intents: Vec<Intent> = read_json(&path)?.unwrap_or_default();
        if !intents.is_empty() {
            tracing::warn!(pending = intents.len(), "Outbox has unclosed intents");
        }

        Ok(Self {
            path,
            intents: Mutex::new(intents.into_iter().map(|i| (i.op_id, i)).collect()),
        })
    }

    fn persist(&self, intents: &BTreeMap<Uuid, Intent>) -> Result<()> {
        let list: Vec<&Intent> = intents.values().collect();
        write_json_atomic(&self.path, &list)
    }

    /// Insert or replace an intent and persist
    pub fn record(&self, intent: &Intent) -> Result<()> {
        let mut intents = self.intents.lock();
        let previous = intents.insert(intent.op_id, intent.clone());
        if let Err(e) = self.persist(&intents) {
            match previous {
                Some(p) => intents.insert(intent.op_id, p),
                None => intents.remove(&intent.op_id),
            };
            return Err(e);
        }
        Ok(())
    }

    /// Remove a finished intent and persist
    pub fn complete(&self, op_id: Uuid) -> Result<()> {
        let mut intents = self.intents.lock();
        if let Some(removed) = intents.remove(&op_id) {
            if let Err(e) = self.persist(&intents) {
                intents.insert(op_id, removed);
                return Err(e);
            }
        }
        Ok(())
    }

    /// Current copy of an intent, if still open
    pub fn get(&self, op_id: Uuid) -> Option<Intent> {
        self.intents.lock().get(&op_id).cloned()
    }

    /// All unclosed intents, oldest first
    pub fn pending(&self) -> Vec<Intent> {
        let mut pending: Vec<Intent> = self.intents.lock().values().cloned().collect();
        pending.sort_by_key(|i| i.created_at);
        pending
    }

    /// Number of unclosed intents
    pub fn len(&self) -> usize {
        self.intents.lock().len()
    }

    /// Whether no intent is open
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DrugStatus;

    fn sample_intent() -> Intent {
        let op_id = Uuid::now_v7();
        Intent::new(
            "revert_drug",
            op_id,
            vec![Step::Chain {
                slot: 0,
                payload: TxPayload::DrugUpdate {
                    drug_id: "D1".into(),
                    status: DrugStatus::Reverted,
                    updated_by: "u1".into(),
                    updated_at: Utc::now(),
                },
                link_to: None,
            }],
        )
    }

    #[test]
    fn test_record_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();

        let outbox = Outbox::open(&config).unwrap();
        let mut intent = sample_intent();
        outbox.record(&intent).unwrap();

        intent.next_step = 1;
        intent.tx_hashes.insert(0, "abc".into());
        outbox.record(&intent).unwrap();
        assert_eq!(outbox.len(), 1);

        let reopened = Outbox::open(&config).unwrap();
        let pending = reopened.pending();
        assert_eq!(pending, vec![intent.clone()]);
        assert!(pending[0].is_complete());
        assert_eq!(pending[0].tx_hash(0), Some("abc"));

        reopened.complete(intent.op_id).unwrap();
        assert!(Outbox::open(&config).unwrap().is_empty());
    }
}
