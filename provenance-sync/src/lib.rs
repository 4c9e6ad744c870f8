//! Provenance Sync
//!
//! Keeps the external store and the hash chain reconciled.
//!
//! # Architecture
//!
//! - **Sync Engine**: periodic pull of store rows; rows without a finalized
//!   chain transaction are anchored and the hash is written back
//! - **Webhook Ingest**: change notifications are authenticated, queued on a
//!   bounded channel and processed by a worker pool with retries
//! - **Idempotency Tracker**: append-only log of processed hashes shared by
//!   both paths
//! - **Dead Letters**: events that exhaust their retries are kept on disk
//!
//! # Example
//!
//! ```no_run
//! use provenance_ledger::{LedgerManager, MemoryStore};
//! use provenance_sync::{Config, SyncNode};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> provenance_sync::Result<()> {
//!     let store = Arc::new(MemoryStore::new());
//!     let manager = LedgerManager::open(provenance_ledger::Config::default(), store).await?;
//!     let node = SyncNode::new(Config::default(), Arc::new(manager))?;
//!
//!     node.engine.start()?;
//!     let body = br#"{"type":"INSERT","table":"drugs","record":{"drug_id":"D1"},"schema":"public"}"#;
//!     node.webhook.submit(None, body)?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod anchor;
pub mod config;
pub mod dlq;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod node;
pub mod snapshot;
pub mod tracker;
pub mod webhook;

// Re-exports
pub use config::Config;
pub use engine::{SyncEngine, SyncLog, SyncState, SyncStatus};
pub use error::{Error, Result};
pub use node::SyncNode;
pub use tracker::IdempotencyTracker;
pub use webhook::{EventProcessor, Outcome, WebhookEvent, WebhookIngest};
