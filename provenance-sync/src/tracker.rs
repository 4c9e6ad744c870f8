//! Idempotency tracker
//!
//! Durable set of processed transaction hashes and record content keys. The
//! set lives in memory and every new entry is appended to
//! `processed_transactions.jsonl` and fsynced before the call returns.
//!
//! A content key can be bound to the chain transaction that anchored it, so a
//! change first seen by webhook ingest and later pulled by the sync engine
//! reuses the same transaction.

use crate::anchor::finalized_tx;
use crate::{Config, Result};
use parking_lot::RwLock;
use provenance_ledger::crypto::{canonical_json, sha256_hex};
use provenance_ledger::external::TX_ID_COLUMN;
use provenance_ledger::storage::{append_json_line, read_json_lines};
use provenance_ledger::{Row, Table};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// One line of the tracker log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
enum Entry {
    Processed(String),
    Bound { key: String, tx_hash: String },
}

#[derive(Debug, Default)]
struct Processed {
    keys: HashSet<String>,
    bound: HashMap<String, String>,
}

/// Processed-hash registry
#[derive(Debug)]
pub struct IdempotencyTracker {
    path: PathBuf,
    processed: RwLock<Processed>,
}

impl IdempotencyTracker {
    /// Load the tracker log
    pub fn open(config: &Config) -> Result<Self> {
        let path = config.tracker_path();
        truncate_torn_tail(&path)?;

        let mut processed = Processed::default();
        for entry in read_json_lines::<Entry>(&path)? {
            match entry {
                Entry::Processed(hash) => {
                    processed.keys.insert(hash);
                }
                Entry::Bound { key, tx_hash } => {
                    processed.keys.insert(key.clone());
                    processed.bound.insert(key, tx_hash);
                }
            }
        }
        info!(
            path = %path.display(),
            processed = processed.keys.len(),
            bound = processed.bound.len(),
            "Idempotency tracker loaded"
        );

        Ok(Self {
            path,
            processed: RwLock::new(processed),
        })
    }

    /// Whether `hash` was already processed
    pub fn is_processed(&self, hash: &str) -> bool {
        self.processed.read().keys.contains(hash)
    }

    /// Record `hash` durably; returns `false` if it was already present
    pub fn mark_processed(&self, hash: &str) -> Result<bool> {
        // The write lock also serializes appends to the log
        let mut processed = self.processed.write();
        if processed.keys.contains(hash) {
            return Ok(false);
        }

        append_json_line(&self.path, &Entry::Processed(hash.to_string()))?;
        processed.keys.insert(hash.to_string());
        debug!(hash, "Marked processed");
        Ok(true)
    }

    /// Mark content `key` processed as anchored by `tx_hash`
    ///
    /// Returns `false` if the key was already bound.
    pub fn bind(&self, key: &str, tx_hash: &str) -> Result<bool> {
        let mut processed = self.processed.write();
        if processed.bound.contains_key(key) {
            return Ok(false);
        }

        append_json_line(
            &self.path,
            &Entry::Bound {
                key: key.to_string(),
                tx_hash: tx_hash.to_string(),
            },
        )?;
        processed.keys.insert(key.to_string());
        processed.bound.insert(key.to_string(), tx_hash.to_string());
        debug!(key, tx_hash, "Content key bound");
        Ok(true)
    }

    /// Transaction that anchored content `key`
    pub fn bound_tx(&self, key: &str) -> Option<String> {
        self.processed.read().bound.get(key).cloned()
    }

    /// Number of processed hashes and keys
    pub fn len(&self) -> usize {
        self.processed.read().keys.len()
    }

    /// Whether nothing was processed yet
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Idempotency key of a record
///
/// A finalized chain id is its own key. Otherwise the key hashes the table,
/// the primary key and the record contents without `blockchain_tx_id`.
pub fn idempotency_key(table: Table, id: &str, record: &Row) -> Result<String> {
    if let Some(tx_hash) = finalized_tx(record) {
        return Ok(tx_hash);
    }
    let mut content = record.clone();
    content.remove(TX_ID_COLUMN);
    let material = format!("{}{}{}", table, id, canonical_json(&content)?);
    Ok(sha256_hex(material.as_bytes()))
}

/// Cut a partial last line so later appends start on a fresh line
fn truncate_torn_tail(path: &Path) -> Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if bytes.last().map_or(true, |b| *b == b'\n') {
        return Ok(());
    }

    let keep = bytes.iter().rposition(|b| *b == b'\n').map_or(0, |i| i + 1);
    warn!(path = %path.display(), dropped = bytes.len() - keep, "Truncating torn tracker line");
    let file = OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    file.sync_all()?;
    Ok(())
}
