//! Actor-based single writer for the hash chain
//!
//! Every append funnels through one task that owns the in-memory chain, so
//! two callers can never compute the same height. Each append is persisted
//! with an atomic rename before the caller is answered; if persisting fails
//! the block is rolled back and the caller gets the error.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────┐
//! │   LedgerManager / SyncEngine / WebhookIngest         │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │               ChainHandle (Clone)                     │
//! │         Sends messages to actor mailbox              │
//! └─────────────────────┬────────────────────────────────┘
//!                       │
//!                       │ mpsc::channel (bounded)
//!                       ▼
//! ┌──────────────────────────────────────────────────────┐
//! │              ChainActor (Single Task)                 │
//! │     ChainLedger: Vec<Block> + tx_hash index          │
//! │                       │                               │
//! │                       ▼                               │
//! │           ChainStorage::save()                        │
//! │        (temp file + fsync + rename)                   │
//! └───────────────────────────────────────────────────────┘
//! ```

use crate::chain::{
    validate, Block, ChainLedger, ChainStatus, ConsistencyReport, Transaction,
    TransactionVerification,
};
use crate::metrics::Metrics;
use crate::storage::ChainStorage;
use crate::{Error, Result};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

/// Message sent to the chain actor
#[derive(Debug)]
pub enum ChainMessage {
    /// Append a transaction as the next block
    Append {
        tx: Transaction,
        response: oneshot::Sender<Result<u64>>,
    },

    /// Get the block containing a transaction
    GetTransaction {
        tx_hash: String,
        response: oneshot::Sender<Option<Block>>,
    },

    /// Get blocks produced by an outbox operation
    GetByOperation {
        op_id: Uuid,
        response: oneshot::Sender<Vec<Block>>,
    },

    /// Get all blocks
    GetBlocks {
        response: oneshot::Sender<Vec<Block>>,
    },

    /// Get chain summary
    GetStatus {
        response: oneshot::Sender<ChainStatus>,
    },

    /// Walk the chain invariants
    ConsistencyCheck {
        response: oneshot::Sender<ConsistencyReport>,
    },

    /// Shutdown actor
    Shutdown,
}

/// Actor that owns the chain
#[derive(Debug)]
pub struct ChainActor {
    /// In-memory chain
    chain: ChainLedger,

    /// Chain file
    storage: ChainStorage,

    /// Mailbox for incoming messages
    mailbox: mpsc::Receiver<ChainMessage>,

    /// Metrics sink
    metrics: Metrics,
}

impl ChainActor {
    /// Create new actor over an already loaded chain
    pub fn new(
        chain: ChainLedger,
        storage: ChainStorage,
        mailbox: mpsc::Receiver<ChainMessage>,
        metrics: Metrics,
    ) -> Self {
        metrics.chain_height.set(chain.height() as i64);
        Self {
            chain,
            storage,
            mailbox,
            metrics,
        }
    }

    /// Run the actor event loop
    pub async fn run(mut self) {
        while let Some(msg) = self.mailbox.recv().await {
            match msg {
                ChainMessage::Shutdown => break,
                msg => self.handle_message(msg),
            }
        }
        tracing::debug!(height = self.chain.height(), "Chain actor stopped");
    }

    /// Handle a single message
    fn handle_message(&mut self, msg: ChainMessage) {
        match msg {
            ChainMessage::Append { tx, response } => {
                let result = self.append(tx);
                let _ = response.send(result);
            }

            ChainMessage::GetTransaction { tx_hash, response } => {
                let _ = response.send(self.chain.get(&tx_hash).cloned());
            }

            ChainMessage::GetByOperation { op_id, response } => {
                let _ = response.send(self.chain.by_operation(op_id));
            }

            ChainMessage::GetBlocks { response } => {
                let _ = response.send(self.chain.blocks().to_vec());
            }

            ChainMessage::GetStatus { response } => {
                let _ = response.send(self.chain.status());
            }

            ChainMessage::ConsistencyCheck { response } => {
                let report = self.chain.consistency_check();
                if !report.is_consistent() {
                    tracing::warn!(
                        broken_at = ?report.broken_at,
                        "Chain consistency check failed: {}",
                        report.error.as_deref().unwrap_or_default()
                    );
                }
                let _ = response.send(report);
            }

            ChainMessage::Shutdown => {
                // Handled in main loop
            }
        }
    }

    fn append(&mut self, tx: Transaction) -> Result<u64> {
        let tx_hash = tx.hash.clone();
        let tx_type = tx.data.payload.tx_type();
        let previous_updated = self.chain.last_updated();

        let height = self.chain.append(tx)?;
        if let Err(e) = self.storage.save(&self.chain) {
            self.chain.rollback_last(previous_updated);
            tracing::error!(tx_hash = %tx_hash, "Failed to persist chain: {}", e);
            return Err(e);
        }

        self.metrics.record_block(height);
        tracing::info!(tx_hash = %tx_hash, tx_type, block_height = height, "Block appended");
        Ok(height)
    }
}

/// Handle for sending messages to the actor
#[derive(Clone, Debug)]
pub struct ChainHandle {
    sender: mpsc::Sender<ChainMessage>,
}

impl ChainHandle {
    /// Create new handle
    pub fn new(sender: mpsc::Sender<ChainMessage>) -> Self {
        Self { sender }
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ChainMessage,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;

        rx.await
            .map_err(|_| Error::Concurrency("Response channel closed".to_string()))
    }

    /// Append a transaction and return the new block height
    pub async fn append(&self, tx: Transaction) -> Result<u64> {
        self.request(|response| ChainMessage::Append { tx, response })
            .await?
    }

    /// Get the block containing `tx_hash`
    pub async fn get_transaction(&self, tx_hash: &str) -> Result<Block> {
        let tx_hash = tx_hash.to_string();
        let key = tx_hash.clone();
        self.request(|response| ChainMessage::GetTransaction { tx_hash, response })
            .await?
            .ok_or(Error::TransactionNotFound(key))
    }

    /// Recompute and check the hash of a stored transaction
    pub async fn verify_transaction(&self, tx_hash: &str) -> Result<TransactionVerification> {
        let block = self.get_transaction(tx_hash).await?;
        Ok(TransactionVerification {
            valid: validate(&block.tx_hash, &block.tx_data),
            tx_hash: block.tx_hash,
            block_height: block.block_height,
            timestamp: block.tx_data.timestamp,
        })
    }

    /// Blocks produced by outbox operation `op_id`
    pub async fn blocks_for_operation(&self, op_id: Uuid) -> Result<Vec<Block>> {
        self.request(|response| ChainMessage::GetByOperation { op_id, response })
            .await
    }

    /// All blocks in order
    pub async fn blocks(&self) -> Result<Vec<Block>> {
        self.request(|response| ChainMessage::GetBlocks { response })
            .await
    }

    /// Chain summary
    pub async fn status(&self) -> Result<ChainStatus> {
        self.request(|response| ChainMessage::GetStatus { response })
            .await
    }

    /// Walk the chain invariants
    pub async fn consistency_check(&self) -> ConsistencyReport {
        match self
            .request(|response| ChainMessage::ConsistencyCheck { response })
            .await
        {
            Ok(report) => report,
            Err(e) => ConsistencyReport::failed(e.to_string()),
        }
    }

    /// Shutdown actor
    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(ChainMessage::Shutdown)
            .await
            .map_err(|_| Error::Concurrency("Actor mailbox closed".to_string()))?;
        Ok(())
    }
}

/// Load the chain from `storage` and spawn its actor
pub fn spawn_chain_actor(
    storage: ChainStorage,
    mailbox_capacity: usize,
    metrics: Metrics,
) -> Result<ChainHandle> {
    let chain = storage.load()?;
    tracing::info!(
        path = %storage.path().display(),
        block_height = chain.height(),
        "Chain loaded"
    );

    let (tx, rx) = mpsc::channel(mailbox_capacity.max(1)); // Bounded channel for backpressure
    let actor = ChainActor::new(chain, storage, rx, metrics);

    tokio::spawn(async move {
        actor.run().await;
    });

    Ok(ChainHandle::new(tx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::ConsistencyStatus;
    use crate::types::{TxData, TxPayload};
    use crate::Config;
    use chrono::Utc;

    fn shipment_create(id: &str) -> Transaction {
        Transaction::create(TxData::new(TxPayload::ShipmentCreate {
            shipment_id: id.to_string(),
            drug_id: "D1".to_string(),
            manufacturer_id: "M1".to_string(),
            distributor_id: "X1".to_string(),
            created_at: Utc::now(),
        }))
        .unwrap()
    }

    fn open(config: &Config) -> ChainHandle {
        let storage = ChainStorage::open(config).unwrap();
        spawn_chain_actor(storage, 16, Metrics::new().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_actor_spawn_and_shutdown() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let handle = open(&config);
        assert!(handle.consistency_check().await.is_consistent());
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_append_and_reload() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let handle = open(&config);
        let first = shipment_create("S1");
        let second = shipment_create("S2");
        assert_eq!(handle.append(first.clone()).await.unwrap(), 1);
        assert_eq!(handle.append(second.clone()).await.unwrap(), 2);

        let block = handle.get_transaction(&second.hash).await.unwrap();
        assert_eq!(block.previous_block_hash, first.hash);
        handle.shutdown().await.unwrap();

        let reopened = open(&config);
        let status = reopened.status().await.unwrap();
        assert_eq!(status.block_height, 2);
        assert!(reopened.verify_transaction(&first.hash).await.unwrap().valid);
        assert!(matches!(
            reopened.get_transaction("missing").await,
            Err(Error::TransactionNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_appends_get_distinct_heights() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let handle = open(&config);
        let mut tasks = Vec::new();
        for i in 0..32 {
            let handle = handle.clone();
            tasks.push(tokio::spawn(async move {
                handle.append(shipment_create(&format!("S{}", i))).await
            }));
        }

        let mut heights = Vec::new();
        for task in tasks {
            heights.push(task.await.unwrap().unwrap());
        }
        heights.sort_unstable();
        assert_eq!(heights, (1..=32).collect::<Vec<u64>>());
        assert!(handle.consistency_check().await.is_consistent());
    }

    #[tokio::test]
    async fn test_tampered_file_is_reported() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.data_dir = temp_dir.path().to_path_buf();

        let handle = open(&config);
        handle.append(shipment_create("S1")).await.unwrap();
        handle.append(shipment_create("S2")).await.unwrap();
        handle.shutdown().await.unwrap();

        let path = config.chain_path();
        let tampered = std::fs::read_to_string(&path).unwrap().replace("\"S2\"", "\"S9\"");
        std::fs::write(&path, tampered).unwrap();

        let reopened = open(&config);
        let report = reopened.consistency_check().await;
        assert_eq!(report.status, ConsistencyStatus::Inconsistent);
        assert_eq!(report.broken_at, Some(1));
    }
}
