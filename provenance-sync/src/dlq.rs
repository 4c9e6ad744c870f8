//! Durable dead-letter log for webhook events that exhausted their retries

use crate::webhook::WebhookEvent;
use crate::{Config, Result};
use chrono::{DateTime, Utc};
use provenance_ledger::storage::{append_json_line, read_json_lines};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::error;
use uuid::Uuid;

/// Dead-lettered event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    /// Ingest ID assigned on submit
    pub id: Uuid,
    /// Original event
    pub event: WebhookEvent,
    /// Last error
    pub failure_reason: String,
    /// Attempts made
    pub attempts: u32,
    /// Failed at
    pub failed_at: DateTime<Utc>,
}

/// Dead Letter Queue
#[derive(Debug)]
pub struct DeadLetterQueue {
    path: PathBuf,
    lock: parking_lot::Mutex<()>,
}

impl DeadLetterQueue {
    /// Dead-letter log at `config.dead_letter_path()`
    pub fn open(config: &Config) -> Self {
        Self {
            path: config.dead_letter_path(),
            lock: parking_lot::Mutex::new(()),
        }
    }

    /// Append an event to the log
    pub fn push(&self, id: Uuid, event: WebhookEvent, failure_reason: String, attempts: u32) -> Result<()> {
        let letter = DeadLetter {
            id,
            event,
            failure_reason,
            attempts,
            failed_at: Utc::now(),
        };

        error!(
            id = %letter.id,
            table = %letter.event.table,
            attempts,
            "Webhook event dead-lettered: {}",
            letter.failure_reason
        );

        let _guard = self.lock.lock();
        append_json_line(&self.path, &letter)?;
        Ok(())
    }

    /// All dead letters, oldest first
    pub fn list(&self) -> Result<Vec<DeadLetter>> {
        let _guard = self.lock.lock();
        Ok(read_json_lines(&self.path)?)
    }
}
