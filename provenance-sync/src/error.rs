//! Error types for sync and webhook ingest

use thiserror::Error;

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Sync errors
#[derive(Error, Debug)]
pub enum Error {
    /// Ledger error
    #[error("Ledger error: {0}")]
    Ledger(#[from] provenance_ledger::Error),

    /// Signature header missing or wrong
    #[error("invalid webhook signature")]
    InvalidSignature,

    /// Webhook body or record is malformed
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    /// Table not handled by this node
    #[error("unhandled table: {0}")]
    UnsupportedTable(String),

    /// Worker queue is full
    #[error("webhook queue full (capacity {0})")]
    QueueFull(usize),

    /// Sync engine already started
    #[error("sync engine is already running")]
    AlreadyRunning,

    /// Sync engine not started
    #[error("sync engine is not running")]
    NotRunning,

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a webhook worker should try again
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Ledger(e) => e.is_retryable(),
            Error::Io(_) => true,
            _ => false,
        }
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
