//! Hash-chained transaction log
//!
//! A [`Transaction`] hashes `timestamp ∥ canonical_json(data) ∥ previous_hash`.
//! A [`ChainLedger`] is the ordered arena of [`Block`]s plus a hash index.
//!
//! # Invariants
//!
//! - `blocks[i].block_height == blocks[i-1].block_height + 1`, first block has height 1
//! - `blocks[i].previous_block_hash == blocks[i-1].tx_hash`, first block links to ""
//! - `block_height == blocks.len()`
//! - Blocks are never modified or removed

use crate::crypto::{canonical_json, hash_timestamp, sha256_hex};
use crate::types::TxData;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Recommendation attached to every failed consistency check
pub const REPAIR_RECOMMENDATION: &str = "Run manual verification and repair process";

/// A hashed chain transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    /// Creation time, part of the hashed material
    pub timestamp: DateTime<Utc>,

    /// Typed payload
    pub data: TxData,

    /// Hash of a logically related transaction, or ""
    #[serde(default)]
    pub previous_hash: String,

    /// SHA-256 hex of timestamp, data and previous hash
    pub hash: String,
}

impl Transaction {
    /// Stamp the current time and hash `data` with an empty previous hash
    pub fn create(data: TxData) -> Result<Self> {
        Self::create_at(data, Utc::now())
    }

    /// Hash `data` at a fixed timestamp
    pub fn create_at(data: TxData, timestamp: DateTime<Utc>) -> Result<Self> {
        data.payload.validate()?;
        let hash = compute_hash(&timestamp, &data, "")?;
        Ok(Self {
            timestamp,
            data,
            previous_hash: String::new(),
            hash,
        })
    }

    /// Re-link to `previous_hash` and recompute the hash
    pub fn set_previous_hash(&mut self, previous_hash: impl Into<String>) -> Result<()> {
        self.previous_hash = previous_hash.into();
        self.hash = compute_hash(&self.timestamp, &self.data, &self.previous_hash)?;
        Ok(())
    }

    /// Recompute the hash from the stored fields
    pub fn recompute_hash(&self) -> Result<String> {
        compute_hash(&self.timestamp, &self.data, &self.previous_hash)
    }
}

/// Hash a transaction's material
pub fn compute_hash(timestamp: &DateTime<Utc>, data: &TxData, previous_hash: &str) -> Result<String> {
    let mut material = hash_timestamp(timestamp);
    material.push_str(&canonical_json(data)?);
    material.push_str(previous_hash);
    Ok(sha256_hex(material.as_bytes()))
}

/// Check that `tx_hash` is the hash of `tx` as created
///
/// The timestamp and previous hash captured in `tx` are reused, so a
/// re-linked transaction validates against its re-linked hash.
pub fn validate(tx_hash: &str, tx: &Transaction) -> bool {
    match tx.recompute_hash() {
        Ok(hash) => hash == tx_hash,
        Err(_) => false,
    }
}

/// One chain entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based position in the chain
    pub block_height: u64,

    /// Hash of the contained transaction
    pub tx_hash: String,

    /// Contained transaction
    pub tx_data: Transaction,

    /// Append time
    pub timestamp: DateTime<Utc>,

    /// `tx_hash` of the preceding block, "" for the first block
    pub previous_block_hash: String,
}

/// Outcome of a consistency walk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsistencyStatus {
    /// All invariants hold
    Consistent,
    /// An invariant is broken
    Inconsistent,
    /// The check itself could not run
    Error,
}

/// Consistency check result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyReport {
    /// Overall status
    pub status: ConsistencyStatus,

    /// Description of the first violation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Index of the first broken block
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<usize>,

    /// When the check ran
    pub timestamp: DateTime<Utc>,

    /// Operator guidance when not consistent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recommendation: Option<String>,
}

impl ConsistencyReport {
    /// Report with no violation
    pub fn consistent() -> Self {
        Self {
            status: ConsistencyStatus::Consistent,
            error: None,
            broken_at: None,
            timestamp: Utc::now(),
            recommendation: None,
        }
    }

    /// Report an invariant violation
    pub fn inconsistent(error: impl Into<String>, broken_at: Option<usize>) -> Self {
        Self {
            status: ConsistencyStatus::Inconsistent,
            error: Some(error.into()),
            broken_at,
            timestamp: Utc::now(),
            recommendation: Some(REPAIR_RECOMMENDATION.to_string()),
        }
    }

    /// Report a failure to run the check
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ConsistencyStatus::Error,
            error: Some(error.into()),
            broken_at: None,
            timestamp: Utc::now(),
            recommendation: Some(REPAIR_RECOMMENDATION.to_string()),
        }
    }

    /// Check if consistent
    pub fn is_consistent(&self) -> bool {
        self.status == ConsistencyStatus::Consistent
    }
}

/// Chain summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    /// Current height
    pub block_height: u64,
    /// Number of stored blocks
    pub block_count: usize,
    /// Last append time
    pub last_updated: DateTime<Utc>,
}

/// Result of verifying one stored transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionVerification {
    /// Transaction hash
    pub tx_hash: String,
    /// Containing block
    pub block_height: u64,
    /// Whether the stored hash matches the recomputed one
    pub valid: bool,
    /// Transaction timestamp
    pub timestamp: DateTime<Utc>,
}

/// On-disk shape of the chain file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainFile {
    /// Ordered blocks
    pub blocks: Vec<Block>,
    /// Last append time
    pub last_updated: DateTime<Utc>,
    /// Always `blocks.len()`
    pub block_height: u64,
}

/// In-memory chain: block arena plus hash index
#[derive(Debug, Clone)]
pub struct ChainLedger {
    blocks: Vec<Block>,
    index: HashMap<String, usize>,
    last_updated: DateTime<Utc>,
}

impl Default for ChainLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ChainLedger {
    /// Empty chain
    pub fn new() -> Self {
        Self {
            blocks: Vec::new(),
            index: HashMap::new(),
            last_updated: Utc::now(),
        }
    }

    /// Rebuild from the file shape. Does not validate; see [`ChainLedger::consistency_check`].
    pub fn from_file(file: ChainFile) -> Self {
        let index = file
            .blocks
            .iter()
            .enumerate()
            .map(|(i, b)| (b.tx_hash.clone(), i))
            .collect();
        Self {
            blocks: file.blocks,
            index,
            last_updated: file.last_updated,
        }
    }

    /// File shape for persistence
    pub fn to_file(&self) -> ChainFile {
        ChainFile {
            blocks: self.blocks.clone(),
            last_updated: self.last_updated,
            block_height: self.height(),
        }
    }

    /// Current height
    pub fn height(&self) -> u64 {
        self.blocks.len() as u64
    }

    /// All blocks in order
    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    /// Last block, if any
    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }

    /// Block containing `tx_hash`
    pub fn get(&self, tx_hash: &str) -> Option<&Block> {
        self.index.get(tx_hash).and_then(|&i| self.blocks.get(i))
    }

    /// Blocks produced by outbox operation `op_id`
    pub fn by_operation(&self, op_id: Uuid) -> Vec<Block> {
        self.blocks
            .iter()
            .filter(|b| b.tx_data.data.op_id == Some(op_id))
            .cloned()
            .collect()
    }

    /// Summary view
    pub fn status(&self) -> ChainStatus {
        ChainStatus {
            block_height: self.height(),
            block_count: self.blocks.len(),
            last_updated: self.last_updated,
        }
    }

    /// Append `tx` as the next block and return the new height
    pub fn append(&mut self, tx: Transaction) -> Result<u64> {
        if !validate(&tx.hash, &tx) {
            return Err(Error::Validation(format!(
                "transaction hash {} does not match its contents",
                tx.hash
            )));
        }
        if self.index.contains_key(&tx.hash) {
            return Err(Error::Conflict(format!(
                "transaction {} already in chain",
                tx.hash
            )));
        }

        let height = self.height() + 1;
        let previous_block_hash = self
            .blocks
            .last()
            .map(|b| b.tx_hash.clone())
            .unwrap_or_default();
        let now = Utc::now();

        self.index.insert(tx.hash.clone(), self.blocks.len());
        self.blocks.push(Block {
            block_height: height,
            tx_hash: tx.hash.clone(),
            tx_data: tx,
            timestamp: now,
            previous_block_hash,
        });
        self.last_updated = now;

        Ok(height)
    }

    /// Undo the last append (used when persisting it failed)
    pub(crate) fn rollback_last(&mut self, previous_updated: DateTime<Utc>) {
        if let Some(block) = self.blocks.pop() {
            self.index.remove(&block.tx_hash);
        }
        self.last_updated = previous_updated;
    }

    /// Last append time
    pub fn last_updated(&self) -> DateTime<Utc> {
        self.last_updated
    }

    /// Walk the chain and report the first broken link
    pub fn consistency_check(&self) -> ConsistencyReport {
        for (i, block) in self.blocks.iter().enumerate() {
            let (expected_height, expected_prev) = match i {
                0 => (1, ""),
                _ => {
                    let prev = &self.blocks[i - 1];
                    (prev.block_height + 1, prev.tx_hash.as_str())
                }
            };

            if block.block_height != expected_height {
                return ConsistencyReport::inconsistent(
                    format!("block height sequence broken at block {}", i),
                    Some(i),
                );
            }
            if block.previous_block_hash != expected_prev {
                return ConsistencyReport::inconsistent(
                    format!("previous block hash mismatch at block {}", i),
                    Some(i),
                );
            }
            if block.tx_hash != block.tx_data.hash || !validate(&block.tx_hash, &block.tx_data) {
                return ConsistencyReport::inconsistent(
                    format!("transaction hash mismatch at block {}", i),
                    Some(i),
                );
            }
        }

        ConsistencyReport::consistent()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DrugStatus, TxPayload};

    fn drug_update(drug_id: &str) -> TxData {
        TxData::new(TxPayload::DrugUpdate {
            drug_id: drug_id.to_string(),
            status: DrugStatus::InTransit,
            updated_by: "user-1".to_string(),
            updated_at: Utc::now(),
        })
    }

    #[test]
    fn test_hash_is_deterministic() {
        let tx = Transaction::create(drug_update("D1")).unwrap();
        assert_eq!(tx.recompute_hash().unwrap(), tx.hash);
        assert!(validate(&tx.hash, &tx));
        assert!(tx.previous_hash.is_empty());
    }

    #[test]
    fn test_set_previous_hash_relinks() {
        let mut tx = Transaction::create(drug_update("D1")).unwrap();
        let original = tx.hash.clone();
        tx.set_previous_hash("abc123").unwrap();
        assert_ne!(tx.hash, original);
        assert!(validate(&tx.hash, &tx));
        assert!(!validate(&original, &tx));
    }

    #[test]
    fn test_validate_detects_changed_data() {
        let tx = Transaction::create(drug_update("D1")).unwrap();
        let mut tampered = tx.clone();
        tampered.data.payload = match tx.data.payload.clone() {
            TxPayload::DrugUpdate {
                status,
                updated_by,
                updated_at,
                ..
            } => TxPayload::DrugUpdate {
                drug_id: "D2".to_string(),
                status,
                updated_by,
                updated_at,
            },
            other => other,
        };
        assert!(!validate(&tx.hash, &tampered));
    }

    #[test]
    fn test_validate_survives_serde_roundtrip() {
        let mut tx = Transaction::create(drug_update("D1")).unwrap();
        tx.set_previous_hash("feed").unwrap();
        let json = serde_json::to_string(&tx).unwrap();
        let back: Transaction = serde_json::from_str(&json).unwrap();
        assert!(validate(&tx.hash, &back));
    }

    #[test]
    fn test_create_rejects_invalid_payload() {
        let result = Transaction::create(drug_update(""));
        assert!(matches!(result, Err(Error::Validation(_))));
    }

    #[test]
    fn test_append_links_blocks() {
        let mut chain = ChainLedger::new();
        assert!(chain.consistency_check().is_consistent());

        for i in 0..5 {
            let tx = Transaction::create(drug_update(&format!("D{}", i))).unwrap();
            let height = chain.append(tx).unwrap();
            assert_eq!(height, i + 1);
        }

        let blocks = chain.blocks();
        assert_eq!(blocks[0].previous_block_hash, "");
        for i in 1..blocks.len() {
            assert_eq!(blocks[i].previous_block_hash, blocks[i - 1].tx_hash);
            assert_eq!(blocks[i].block_height, blocks[i - 1].block_height + 1);
        }
        assert!(chain.consistency_check().is_consistent());
        assert_eq!(chain.to_file().block_height, 5);
    }

    #[test]
    fn test_append_rejects_duplicate() {
        let mut chain = ChainLedger::new();
        let tx = Transaction::create(drug_update("D1")).unwrap();
        chain.append(tx.clone()).unwrap();
        assert!(matches!(chain.append(tx), Err(Error::Conflict(_))));
    }

    #[test]
    fn test_consistency_detects_broken_link() {
        let mut chain = ChainLedger::new();
        for i in 0..3 {
            chain
                .append(Transaction::create(drug_update(&format!("D{}", i))).unwrap())
                .unwrap();
        }

        let mut file = chain.to_file();
        file.blocks[2].previous_block_hash = "bogus".to_string();
        let report = ChainLedger::from_file(file).consistency_check();
        assert_eq!(report.status, ConsistencyStatus::Inconsistent);
        assert_eq!(report.broken_at, Some(2));
        assert_eq!(
            report.error.as_deref(),
            Some("previous block hash mismatch at block 2")
        );
        assert_eq!(report.recommendation.as_deref(), Some(REPAIR_RECOMMENDATION));

        let mut file = chain.to_file();
        file.blocks[1].block_height = 7;
        let report = ChainLedger::from_file(file).consistency_check();
        assert_eq!(report.broken_at, Some(1));
    }
}
