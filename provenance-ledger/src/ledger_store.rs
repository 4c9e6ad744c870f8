//! Persistent ledger files with one writer lock per resource
//!
//! Manufacturer ledgers are created lazily on first access and cached. Every
//! mutation runs against a copy, is persisted atomically, and only then
//! replaces the cached value, so memory never runs ahead of disk.
//!
//! Mutations do blocking file IO. Async callers run them on the blocking
//! pool; readers only wait for the final swap, never for the fsync.

use crate::ledger::{CommonLedger, ManufacturerLedger};
use crate::storage::{read_json, write_json_atomic};
use crate::{Config, Error, Result};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// One ledger file's cached value plus its writer lock
#[derive(Debug)]
struct LedgerSlot<T> {
    writer: Mutex<()>,
    state: RwLock<T>,
}

impl<T: Clone + Serialize> LedgerSlot<T> {
    fn new(value: T) -> Self {
        Self {
            writer: Mutex::new(()),
            state: RwLock::new(value),
        }
    }

    fn mutate<R>(&self, path: &Path, f: impl FnOnce(&mut T) -> Result<R>) -> Result<R> {
        let _writer = self.writer.lock();

        let mut next = self.state.read().clone();
        let out = f(&mut next)?;
        write_json_atomic(path, &next)?;
        *self.state.write() = next;
        Ok(out)
    }
}

/// Ledger file store
#[derive(Debug)]
pub struct LedgerStore {
    manufacturer_dir: PathBuf,
    common_path: PathBuf,
    manufacturers: DashMap<String, Arc<LedgerSlot<ManufacturerLedger>>>,
    common: LedgerSlot<CommonLedger>,
}

impl LedgerStore {
    /// Open the ledger directory and load the common ledger
    pub fn open(config: &Config) -> Result<Self> {
        let manufacturer_dir = config.manufacturer_ledger_dir();
        std::fs::create_dir_all(&manufacturer_dir)?;

        let common_path = config.common_ledger_path();
        let common = match read_json::<CommonLedger>(&common_path)? {
            Some(ledger) => ledger,
            None => {
                let ledger = CommonLedger::new();
                write_json_atomic(&common_path, &ledger)?;
                ledger
            }
        };

        Ok(Self {
            manufacturer_dir,
            common_path,
            manufacturers: DashMap::new(),
            common: LedgerSlot::new(common),
        })
    }

    fn manufacturer_path(&self, manufacturer_id: &str) -> Result<PathBuf> {
        validate_manufacturer_id(manufacturer_id)?;
        Ok(self.manufacturer_dir.join(format!("{}.json", manufacturer_id)))
    }

    fn manufacturer_slot(&self, manufacturer_id: &str) -> Result<Arc<LedgerSlot<ManufacturerLedger>>> {
        if let Some(slot) = self.manufacturers.get(manufacturer_id) {
            return Ok(slot.clone());
        }

        let path = self.manufacturer_path(manufacturer_id)?;
        let entry = self.manufacturers.entry(manufacturer_id.to_string());
        let slot = match entry {
            dashmap::mapref::entry::Entry::Occupied(o) => o.get().clone(),
            dashmap::mapref::entry::Entry::Vacant(v) => {
                let ledger = match read_json::<ManufacturerLedger>(&path)? {
                    Some(ledger) => ledger,
                    None => {
                        let ledger = ManufacturerLedger::new(manufacturer_id);
                        write_json_atomic(&path, &ledger)?;
                        tracing::info!(manufacturer_id, "Created manufacturer ledger");
                        ledger
                    }
                };
                v.insert(Arc::new(LedgerSlot::new(ledger))).clone()
            }
        };
        Ok(slot)
    }

    /// Snapshot of a manufacturer ledger, created if absent
    pub fn manufacturer(&self, manufacturer_id: &str) -> Result<ManufacturerLedger> {
        let slot = self.manufacturer_slot(manufacturer_id)?;
        let ledger = slot.state.read().clone();
        Ok(ledger)
    }

    /// Mutate a manufacturer ledger under its writer lock
    pub fn with_manufacturer<T>(
        &self,
        manufacturer_id: &str,
        f: impl FnOnce(&mut ManufacturerLedger) -> Result<T>,
    ) -> Result<T> {
        let path = self.manufacturer_path(manufacturer_id)?;
        self.manufacturer_slot(manufacturer_id)?.mutate(&path, f)
    }

    /// Snapshot of the common ledger
    pub fn common(&self) -> CommonLedger {
        self.common.state.read().clone()
    }

    /// Read from the common ledger without copying it
    pub fn read_common<T>(&self, f: impl FnOnce(&CommonLedger) -> T) -> T {
        f(&self.common.state.read())
    }

    /// Mutate the common ledger under its writer lock
    pub fn with_common<T>(&self, f: impl FnOnce(&mut CommonLedger) -> Result<T>) -> Result<T> {
        self.common.mutate(&self.common_path, f)
    }

    /// IDs of all manufacturer ledgers on disk
    pub fn list_manufacturers(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in std::fs::read_dir(&self.manufacturer_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                ids.push(stem.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }

    /// Delete a manufacturer ledger file
    pub fn delete_manufacturer(&self, manufacturer_id: &str) -> Result<()> {
        let path = self.manufacturer_path(manufacturer_id)?;
        let slot = self.manufacturers.remove(manufacturer_id);
        let _guard = slot.as_ref().map(|(_, s)| s.writer.lock());

        match std::fs::remove_file(&path) {
            Ok(()) => {
                tracing::info!(manufacturer_id, "Deleted manufacturer ledger");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(Error::LedgerNotFound(manufacturer_id.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn validate_manufacturer_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid manufacturer id: {:?}", id)))
    }
}
