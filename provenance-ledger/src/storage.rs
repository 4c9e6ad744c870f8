//! JSON file storage
//!
//! Every whole-file write goes through [`write_json_atomic`]: serialize to a
//! sibling temp file, fsync, then rename over the target. Readers never see a
//! half-written file.
//!
//! # Files
//!
//! - `blockchain_ledger.json` - chain ledger ([`ChainStorage`])
//! - `manufacturer_ledgers/{id}.json` - one per manufacturer
//! - `common_ledger.json` - common ledger
//! - `outbox.json` - unclosed operation intents

use crate::chain::{ChainFile, ChainLedger};
use crate::{Config, Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

/// Read and deserialize a JSON file, `None` if it does not exist
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let value = serde_json::from_slice(&bytes).map_err(|e| {
        Error::Storage(format!("Failed to parse {}: {}", path.display(), e))
    })?;
    Ok(Some(value))
}

/// Serialize `value` as pretty JSON and atomically replace `path`
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;

    // Write atomically via temp file
    let temp_path = temp_path_for(path);
    let mut file = File::create(&temp_path)?;
    file.write_all(&bytes)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Storage(format!("Failed to replace {}: {}", path.display(), e))
    })
}

fn temp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Append one JSON value as a line and fsync before returning
pub fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut line = serde_json::to_vec(value)?;
    line.push(b'\n');

    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.write_all(&line)?;
    file.sync_data()?;
    Ok(())
}

/// Read a JSON Lines file
///
/// A trailing line that fails to parse (torn write) is skipped with a warning.
/// A bad line anywhere else is a storage error.
pub fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let lines: Vec<String> = BufReader::new(file)
        .lines()
        .collect::<std::io::Result<_>>()?;
    let last = lines.len().saturating_sub(1);

    let mut values = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line) {
            Ok(value) => values.push(value),
            Err(e) if i == last => {
                tracing::warn!(
                    path = %path.display(),
                    line = i + 1,
                    "Ignoring torn trailing line: {}",
                    e
                );
            }
            Err(e) => {
                return Err(Error::Storage(format!(
                    "Corrupt line {} in {}: {}",
                    i + 1,
                    path.display(),
                    e
                )))
            }
        }
    }
    Ok(values)
}

/// Chain ledger file
#[derive(Debug, Clone)]
pub struct ChainStorage {
    path: PathBuf,
}

impl ChainStorage {
    /// Open the chain file location, creating the data directory
    pub fn open(config: &Config) -> Result<Self> {
        fs::create_dir_all(&config.data_dir)?;
        Ok(Self {
            path: config.chain_path(),
        })
    }

    /// File path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the chain, empty if the file does not exist yet
    pub fn load(&self) -> Result<ChainLedger> {
        match read_json::<ChainFile>(&self.path)? {
            Some(file) => {
                if file.block_height != file.blocks.len() as u64 {
                    tracing::warn!(
                        recorded = file.block_height,
                        actual = file.blocks.len(),
                        "Chain file height disagrees with block count"
                    );
                }
                Ok(ChainLedger::from_file(file))
            }
            None => Ok(ChainLedger::new()),
        }
    }

    /// Persist the whole chain
    pub fn save(&self, chain: &ChainLedger) -> Result<()> {
        write_json_atomic(&self.path, &chain.to_file())
    }
}
