//! Provenance Ledger Core
//!
//! Hash-chained transaction log, per-manufacturer and common ledgers, and the
//! manager that keeps them aligned with the external relational store.
//!
//! # Architecture
//!
//! - **Single Writer Chain**: One actor task owns the block list and its file
//! - **Per-Resource Ledgers**: Each ledger file has its own writer lock
//! - **Outbox Intents**: Multi-store operations are planned, persisted, then
//!   executed step by step so an interrupted operation can be replayed
//! - **Entity Locks**: Operations on the same drug or shipment never interleave
//!
//! # Invariants
//!
//! - Append-only: blocks and history entries are never modified or deleted
//! - Block `n` carries height `n` and links to block `n - 1`
//! - Every stored transaction hash recomputes from its contents
//! - Terminal statuses (`delivered`, `reverted`, `failed`) never change

#![forbid(unsafe_code)]
#![warn(
    missing_docs,
    rust_2018_idioms,
    missing_debug_implementations,
    clippy::all
)]

pub mod actor;
pub mod chain;
pub mod config;
pub mod crypto;
pub mod error;
pub mod external;
pub mod ledger;
pub mod ledger_store;
pub mod locks;
pub mod manager;
pub mod metrics;
pub mod outbox;
pub mod storage;
pub mod types;

// Re-exports
pub use actor::ChainHandle;
pub use chain::{Block, ConsistencyReport, ConsistencyStatus, Transaction};
pub use config::Config;
pub use error::{Error, Result};
pub use external::{ExternalStore, MemoryStore, Row, Table};
pub use ledger::{CommonLedger, ManufacturerLedger};
pub use manager::{LedgerManager, ReconcileSummary};
pub use types::{DrugStatus, ShipmentStatus, Status, TxData, TxPayload};
