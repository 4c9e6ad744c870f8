//! Configuration for sync and webhook ingest

use provenance_ledger::Table;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Sync node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Root directory for tracker, snapshots, sync logs and dead letters
    pub data_dir: PathBuf,

    /// Service name
    pub service_name: String,

    /// Periodic sync configuration
    pub sync: SyncConfig,

    /// Webhook ingest configuration
    pub webhook: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./blockchain_data"),
            service_name: "provenance-sync".to_string(),
            sync: SyncConfig::default(),
            webhook: WebhookConfig::default(),
        }
    }
}

/// Periodic sync configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds between cycles (default: 60)
    pub interval_secs: u64,

    /// Tables pulled each cycle
    pub tables: Vec<Table>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            tables: vec![Table::Drugs, Table::Shipments],
        }
    }
}

impl SyncConfig {
    /// Interval as a duration
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// Webhook ingest configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared secret expected in `X-Webhook-Signature`; unchecked when unset
    pub secret: Option<String>,

    /// Attempts before an event is dead-lettered
    pub max_retries: u32,

    /// Backoff unit; attempt `i` sleeps `i` units
    pub backoff_unit_ms: u64,

    /// Worker tasks
    pub workers: usize,

    /// Queue capacity before `QueueFull`
    pub queue_capacity: usize,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            max_retries: 3,
            backoff_unit_ms: 1000,
            workers: 4,
            queue_capacity: 256,
        }
    }
}

impl Config {
    /// Idempotency tracker log
    pub fn tracker_path(&self) -> PathBuf {
        self.data_dir.join("processed_transactions.jsonl")
    }

    /// Record snapshot directory
    pub fn records_dir(&self) -> PathBuf {
        self.data_dir.join("data_records")
    }

    /// Sync cycle log directory
    pub fn sync_log_dir(&self) -> PathBuf {
        self.data_dir.join("sync_logs")
    }

    /// Dead-letter log
    pub fn dead_letter_path(&self) -> PathBuf {
        self.data_dir.join("dead_letters.jsonl")
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

        if let Ok(data_dir) = std::env::var("SYNC_DATA_DIR") {
            config.data_dir = PathBuf::from(data_dir);
        }

        if let Ok(interval) = std::env::var("SYNC_INTERVAL_SECS") {
            config.sync.interval_secs = parse_var("SYNC_INTERVAL_SECS", &interval)?;
        }

        if let Ok(secret) = std::env::var("WEBHOOK_SECRET") {
            if !secret.is_empty() {
                config.webhook.secret = Some(secret);
            }
        }

        if let Ok(retries) = std::env::var("WEBHOOK_MAX_RETRIES") {
            config.webhook.max_retries = parse_var("WEBHOOK_MAX_RETRIES", &retries)?;
        }

        if let Ok(workers) = std::env::var("WEBHOOK_WORKERS") {
            config.webhook.workers = parse_var("WEBHOOK_WORKERS", &workers)?;
        }

        if let Ok(capacity) = std::env::var("WEBHOOK_QUEUE_CAPACITY") {
            config.webhook.queue_capacity = parse_var("WEBHOOK_QUEUE_CAPACITY", &capacity)?;
        }

        Ok(config)
    }
}

fn parse_var<T>(name: &str, value: &str) -> crate::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| crate::Error::Config(format!("Invalid {}: {}", name, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.sync.tables, vec![Table::Drugs, Table::Shipments]);
        assert_eq!(config.webhook.max_retries, 3);
        assert!(config.webhook.secret.is_none());
        assert_eq!(
            config.tracker_path(),
            PathBuf::from("./blockchain_data/processed_transactions.jsonl")
        );
    }

    #[test]
    fn test_from_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/srv/provenance"
service_name = "provenance-sync"

[sync]
interval_secs = 15
tables = ["drugs"]

[webhook]
secret = "s3cret"
max_retries = 5
backoff_unit_ms = 10
workers = 2
queue_capacity = 8
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.sync.tables, vec![Table::Drugs]);
        assert_eq!(config.webhook.secret.as_deref(), Some("s3cret"));
        assert_eq!(config.records_dir(), PathBuf::from("/srv/provenance/data_records"));
    }

    #[test]
    fn test_bad_number_is_config_error() {
        assert!(matches!(
            parse_var::<u64>("SYNC_INTERVAL_SECS", "soon"),
            Err(crate::Error::Config(_))
        ));
    }
}
