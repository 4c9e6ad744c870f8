//! Error types for the provenance ledger

use thiserror::Error;

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, Error>;

/// Ledger errors
#[derive(Error, Debug)]
pub enum Error {
    /// Missing required field or malformed input
    #[error("Validation error: {0}")]
    Validation(String),

    /// Drug not found
    #[error("drug {0} not found in ledger")]
    DrugNotFound(String),

    /// Shipment not found
    #[error("shipment {0} not found in ledger")]
    ShipmentNotFound(String),

    /// Manufacturer ledger not found
    #[error("manufacturer ledger {0} not found")]
    LedgerNotFound(String),

    /// Chain transaction not found
    #[error("transaction {0} not found in chain")]
    TransactionNotFound(String),

    /// Entity already exists
    #[error("{0}")]
    Conflict(String),

    /// Status change not allowed from the current state
    #[error("invalid {entity} transition from {from} to {to}")]
    InvalidTransition {
        /// Entity kind ("drug" or "shipment")
        entity: &'static str,
        /// Current status
        from: String,
        /// Requested status
        to: String,
    },

    /// External store call failed
    #[error("External store error: {0}")]
    ExternalStore(String),

    /// Local file storage error
    #[error("Storage error: {0}")]
    Storage(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Concurrency error (actor mailbox closed, etc.)
    #[error("Concurrency error: {0}")]
    Concurrency(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether the failure is transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ExternalStore(_) | Error::Storage(_) | Error::Io(_) | Error::Concurrency(_)
        )
    }

    /// Whether the failure means the target entity is absent
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::DrugNotFound(_)
                | Error::ShipmentNotFound(_)
                | Error::LedgerNotFound(_)
                | Error::TransactionNotFound(_)
        )
    }
}

impl From<String> for Error {
    fn from(msg: String) -> Self {
        Error::Other(msg)
    }
}

impl From<&str> for Error {
    fn from(msg: &str) -> Self {
        Error::Other(msg.to_string())
    }
}
