//! Record snapshots and deletion tombstones under `data_records/`

use crate::{Config, Result};
use chrono::{DateTime, Utc};
use provenance_ledger::storage::write_json_atomic;
use provenance_ledger::{Row, Table};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::debug;

/// Deleted-record marker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    /// Time the deletion was ingested
    pub deleted_at: DateTime<Utc>,
    /// Record as it was before deletion
    pub original_record: Row,
}

/// Snapshot directory
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Snapshot store rooted at `config.records_dir()`
    pub fn open(config: &Config) -> Result<Self> {
        let dir = config.records_dir();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Persist `record` as `{table}_{id}_{ts}.json`
    pub fn save_record(&self, table: Table, id: &str, record: &Row) -> Result<PathBuf> {
        let path = self.file_path(table, id, "");
        write_json_atomic(&path, record)?;
        debug!(table = %table, id, path = %path.display(), "Record snapshot saved");
        Ok(path)
    }

    /// Persist a tombstone as `{table}_{id}_{ts}_deleted.json`
    pub fn save_tombstone(&self, table: Table, id: &str, original_record: Row) -> Result<PathBuf> {
        let path = self.file_path(table, id, "_deleted");
        let tombstone = Tombstone {
            deleted_at: Utc::now(),
            original_record,
        };
        write_json_atomic(&path, &tombstone)?;
        debug!(table = %table, id, path = %path.display(), "Tombstone saved");
        Ok(path)
    }

    /// Snapshot and tombstone files for one record, oldest first
    pub fn files_for(&self, table: Table, id: &str) -> Result<Vec<PathBuf>> {
        let prefix = format!("{}_{}_", table, file_safe(id));
        let mut files = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let path = entry?.path();
            let matches = path
                .file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with(&prefix) && n.ends_with(".json"));
            if matches {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn file_path(&self, table: Table, id: &str, suffix: &str) -> PathBuf {
        let ts = Utc::now().format("%Y%m%d%H%M%S%9f");
        self.dir
            .join(format!("{}_{}_{}{}.json", table, file_safe(id), ts, suffix))
    }
}

/// Percent-encode every byte outside `[A-Za-z0-9-]`
///
/// Distinct ids map to distinct names, and `_` never appears in the output.
fn file_safe(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for b in id.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' {
            out.push(char::from(b));
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// Whether `path` is a tombstone file
pub fn is_tombstone(path: &std::path::Path) -> bool {
    path.file_stem()
        .and_then(|s| s.to_str())
        .map_or(false, |s| s.ends_with("_deleted"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_snapshot_and_tombstone_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let store = SnapshotStore::open(&config).unwrap();

        let mut record = Row::new();
        record.insert("drug_id".into(), json!("D1"));
        record.insert("blockchain_tx_id".into(), json!("abc"));

        let saved = store.save_record(Table::Drugs, "D1", &record).unwrap();
        let tomb = store.save_tombstone(Table::Drugs, "D1", record.clone()).unwrap();
        store.save_record(Table::Drugs, "D10", &record).unwrap();

        let files = store.files_for(Table::Drugs, "D1").unwrap();
        assert_eq!(files.len(), 2);
        assert!(!is_tombstone(&saved));
        assert!(is_tombstone(&tomb));

        let stored: Tombstone =
            serde_json::from_slice(&std::fs::read(&tomb).unwrap()).unwrap();
        assert_eq!(stored.original_record, record);
    }

    #[test]
    fn test_similar_ids_do_not_share_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = dir.path().to_path_buf();
        let store = SnapshotStore::open(&config).unwrap();

        let record = Row::new();
        for id in ["a.b", "a-b", "a_b", "a/b"] {
            store.save_record(Table::Drugs, id, &record).unwrap();
        }

        for id in ["a.b", "a-b", "a_b", "a/b"] {
            assert_eq!(store.files_for(Table::Drugs, id).unwrap().len(), 1, "{}", id);
        }
        assert_eq!(file_safe("a.b"), "a%2Eb");
        assert_eq!(file_safe("D-1"), "D-1");
    }
}
