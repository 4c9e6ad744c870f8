//! Configuration for the provenance ledger

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Ledger configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for chain, ledger and outbox files
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Service version
    pub service_version: String,

    /// Chain actor configuration
    pub chain: ChainConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blockchain_data"),
            service_name: "provenance-ledger".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            chain: ChainConfig::default(),
        }
    }
}

/// Chain actor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Chain file name inside `data_dir`
    pub file_name: String,

    /// Bounded mailbox size for the chain actor
    pub mailbox_capacity: usize,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            file_name: "blockchain_ledger.json".to_string(),
            mailbox_capacity: 1000,
        }
    }
}

impl Config {
    /// Path of the chain ledger file
    pub fn chain_path(&self) -> PathBuf {
        self.data_dir.join(&self.chain.file_name)
    }

    /// Directory holding one file per manufacturer ledger
    pub fn manufacturer_ledger_dir(&self) -> PathBuf {
        self.data_dir.join("manufacturer_ledgers")
    }

    /// Path of the common ledger file
    pub fn common_ledger_path(&self) -> PathBuf {
        self.data_dir.join("common_ledger.json")
    }

    /// Path of the outbox intent file
    pub fn outbox_path(&self) -> PathBuf {
        self.data_dir.join("outbox.json")
    }

    /// Load from file
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| crate::Error::Config(format!("Failed to parse config: {}", e)))?;
        Ok(config)
    }

    /// Load from environment variables
    pub fn from_env() -> crate::Result<Self> {
        let mut config = Config::default();

        if let Ok(data_dir) = std::env::var("LEDGER_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(capacity) = std::env::var("LEDGER_MAILBOX_CAPACITY") {
            config.chain.mailbox_capacity = capacity.parse().map_err(|e| {
                crate::Error::Config(format!("Invalid LEDGER_MAILBOX_CAPACITY: {}", e))
            })?;
        }

        Ok(config)
    }
}
