//! End-to-end tests for the Ledger Manager against the in-memory store

use provenance_ledger::{
    external::{eq, from_row, DrugRow, ShipmentRow, TX_ID_COLUMN},
    manager::REPLAY_RECOMMENDATION,
    types::{CreateDrugParams, CreateShipmentParams, RevertDrugParams, UpdateShipmentStatusParams},
    Config, ConsistencyStatus, DrugStatus, Error, ExternalStore, LedgerManager, MemoryStore,
    Row, ShipmentStatus, Table, TxPayload,
};
use serde_json::json;
use std::sync::Arc;

fn config(dir: &std::path::Path) -> Config {
    let mut config = Config::default();
    config.data_dir = dir.to_path_buf();
    config
}

async fn open(dir: &std::path::Path, store: &Arc<MemoryStore>) -> LedgerManager {
    LedgerManager::open(config(dir), store.clone() as Arc<dyn ExternalStore>)
        .await
        .unwrap()
}

fn drug(drug_id: &str, manufacturer_id: &str) -> CreateDrugParams {
    CreateDrugParams {
        drug_id: drug_id.into(),
        manufacturer_id: manufacturer_id.into(),
        name: "Amoxicillin".into(),
        description: "500mg capsules".into(),
        user_id: "user-1".into(),
        location: "Plant 4".into(),
    }
}

fn shipment(shipment_id: &str, drug_id: &str, manufacturer_id: &str) -> CreateShipmentParams {
    CreateShipmentParams {
        shipment_id: shipment_id.into(),
        drug_id: drug_id.into(),
        manufacturer_id: manufacturer_id.into(),
        distributor_id: "DIST-1".into(),
        user_id: "user-1".into(),
        location: "Dock 2".into(),
    }
}

fn move_shipment(shipment_id: &str, status: &str) -> UpdateShipmentStatusParams {
    UpdateShipmentStatusParams {
        shipment_id: shipment_id.into(),
        status: status.into(),
        user_id: "driver-7".into(),
        location: "Highway 9".into(),
    }
}

fn revert(drug_id: &str) -> RevertDrugParams {
    RevertDrugParams {
        drug_id: drug_id.into(),
        manufacturer_id: "M1".into(),
        reason: "recall".into(),
        user_id: "qa-2".into(),
        location: "Plant 4".into(),
    }
}

async fn drug_row(store: &MemoryStore, drug_id: &str) -> DrugRow {
    let rows = store
        .select(Table::Drugs, "*", &eq("drug_id", drug_id))
        .await
        .unwrap();
    from_row(rows.into_iter().next().unwrap()).unwrap()
}

fn statuses(history: &[provenance_ledger::Status]) -> Vec<&str> {
    history.iter().map(|s| s.status.as_str()).collect()
}

#[tokio::test]
async fn test_create_drug_writes_every_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    let vhash = manager.create_drug(drug("D1", "M1")).await.unwrap();
    assert_eq!(vhash.len(), 64);

    let status = manager.chain_status().await.unwrap();
    assert_eq!(status.block_height, 1);

    let row = drug_row(&store, "D1").await;
    assert_eq!(row.verification_hash, vhash);
    assert_eq!(row.status, "created");
    let block = manager.get_transaction(&row.blockchain_tx_id).await.unwrap();
    assert_eq!(block.tx_data.data.payload.tx_type(), "drug_create");

    let mfr = manager.ledgers().manufacturer("M1").unwrap();
    assert_eq!(mfr.drug("D1").unwrap().current_status, DrugStatus::Created);
    let common = manager.ledgers().common();
    assert_eq!(common.drug("D1").unwrap().verification_hash, vhash);

    let updates = manager.drug_status_updates("D1").await.unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0].blockchain_tx_id, row.blockchain_tx_id);

    assert!(manager.verify_drug("D1").await.unwrap());
    assert!(manager.consistency_check().await.is_consistent());
    assert!(manager.pending_intents().is_empty());
    assert_eq!(manager.metrics().operation_count("create_drug", true), 1);
}

#[tokio::test]
async fn test_duplicate_drug_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    let err = manager.create_drug(drug("D1", "M1")).await.unwrap_err();
    assert!(matches!(err, Error::Conflict(_)));
    assert_eq!(manager.chain_status().await.unwrap().block_height, 1);
    assert_eq!(manager.metrics().operation_count("create_drug", false), 1);
}

#[tokio::test]
async fn test_delivery_cascades_to_drug() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    let shipment_tx = manager.create_shipment(shipment("S1", "D1", "M1")).await.unwrap();

    // The drug update is linked to the shipment transaction
    let blocks = manager.chain().blocks().await.unwrap();
    assert_eq!(blocks.len(), 3);
    assert_eq!(blocks[1].tx_hash, shipment_tx);
    assert_eq!(blocks[2].tx_data.previous_hash, shipment_tx);

    manager
        .update_shipment_status(move_shipment("S1", "in_transit"))
        .await
        .unwrap();
    manager
        .update_shipment_status(move_shipment("S1", "delivered"))
        .await
        .unwrap();

    let drug_history = manager.drug_history("D1").unwrap();
    assert_eq!(statuses(&drug_history), vec!["created", "in_transit", "delivered"]);
    assert_eq!(
        drug_history[1].details.as_deref(),
        Some("Drug added to shipment S1")
    );
    assert_eq!(
        drug_history[2].details.as_deref(),
        Some("Drug delivered via shipment S1")
    );

    let shipment_history = manager.shipment_history("S1").unwrap();
    assert_eq!(
        statuses(&shipment_history),
        vec!["created", "in_transit", "delivered"]
    );
    assert_eq!(
        shipment_history[2].details.as_deref(),
        Some("Shipment status updated to delivered")
    );

    let mfr_history = manager.manufacturer_drug_history("M1", "D1").unwrap();
    assert_eq!(mfr_history, drug_history);

    let row = drug_row(&store, "D1").await;
    assert_eq!(row.status, "delivered");
    let rows = store
        .select(Table::Shipments, "*", &eq("shipment_id", "S1"))
        .await
        .unwrap();
    let shipment_row: ShipmentRow = from_row(rows.into_iter().next().unwrap()).unwrap();
    assert_eq!(shipment_row.status, "delivered");

    assert_eq!(manager.drug_status_updates("D1").await.unwrap().len(), 3);
    assert_eq!(manager.shipment_status_updates("S1").await.unwrap().len(), 3);
    assert_eq!(manager.distributor_shipments("DIST-1").len(), 1);

    // 1 drug_create, 2 for the shipment, 1 in_transit, 2 for delivery
    assert_eq!(manager.chain_status().await.unwrap().block_height, 6);
    assert!(manager.verify_drug("D1").await.unwrap());
    assert!(manager.consistency_check().await.is_consistent());

    let err = manager
        .update_shipment_status(move_shipment("S1", "in_transit"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition { entity: "shipment", .. }));
}

#[tokio::test]
async fn test_revert_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    let revert_tx = manager.revert_drug(revert("D1")).await.unwrap();

    let row = drug_row(&store, "D1").await;
    assert_eq!(row.status, "reverted");
    assert_eq!(row.blockchain_tx_id, revert_tx);
    assert!(row.reverted_at.is_some());

    let common = manager.ledgers().common();
    let record = &common.drug("D1").unwrap().record;
    assert_eq!(record.current_status, DrugStatus::Reverted);
    assert!(record.reverted_at.is_some());
    assert_eq!(
        record.history.last().unwrap().details.as_deref(),
        Some("Drug reverted: recall")
    );

    let block = manager.get_transaction(&revert_tx).await.unwrap();
    assert!(matches!(block.tx_data.data.payload, TxPayload::DrugRevert { .. }));
    assert!(manager.verify_drug("D1").await.unwrap());

    assert!(matches!(
        manager.revert_drug(revert("D1")).await,
        Err(Error::InvalidTransition { entity: "drug", .. })
    ));
    assert!(matches!(
        manager.create_shipment(shipment("S1", "D1", "M1")).await,
        Err(Error::InvalidTransition { entity: "drug", .. })
    ));
}

#[tokio::test]
async fn test_delivery_after_revert_keeps_drug_reverted() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    manager.create_shipment(shipment("S1", "D1", "M1")).await.unwrap();
    manager.revert_drug(revert("D1")).await.unwrap();
    let height = manager.chain_status().await.unwrap().block_height;

    manager
        .update_shipment_status(move_shipment("S1", "delivered"))
        .await
        .unwrap();

    let common = manager.ledgers().common();
    assert_eq!(
        common.shipment("S1").unwrap().record.current_status,
        ShipmentStatus::Delivered
    );
    assert_eq!(
        common.drug("D1").unwrap().record.current_status,
        DrugStatus::Reverted
    );
    // Only the shipment transaction was appended
    assert_eq!(manager.chain_status().await.unwrap().block_height, height + 1);
    assert_eq!(drug_row(&store, "D1").await.status, "reverted");
}

#[tokio::test]
async fn test_invalid_input_is_rejected_before_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    manager.create_shipment(shipment("S1", "D1", "M1")).await.unwrap();

    assert!(matches!(
        manager.update_shipment_status(move_shipment("S1", "lost")).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        manager.update_shipment_status(move_shipment("S9", "delivered")).await,
        Err(Error::ShipmentNotFound(_))
    ));
    assert!(matches!(
        manager.create_shipment(shipment("S2", "D9", "M1")).await,
        Err(Error::DrugNotFound(_))
    ));
    assert!(matches!(
        manager.create_shipment(shipment("S2", "D1", "M2")).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        manager.revert_drug(revert("D9")).await,
        Err(Error::DrugNotFound(_))
    ));

    let mut missing_name = drug("D2", "M1");
    missing_name.name = " ".into();
    assert!(matches!(
        manager.create_drug(missing_name).await,
        Err(Error::Validation(_))
    ));

    assert_eq!(manager.chain_status().await.unwrap().block_height, 3);
    assert!(manager.pending_intents().is_empty());
}

#[tokio::test]
async fn test_verify_detects_mismatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    manager.create_drug(drug("D2", "M1")).await.unwrap();

    let mut patch = Row::new();
    patch.insert("verification_hash".into(), json!("0".repeat(64)));
    store.update(Table::Drugs, "D1", patch).await.unwrap();
    assert!(!manager.verify_drug("D1").await.unwrap());

    let mut patch = Row::new();
    patch.insert(TX_ID_COLUMN.into(), json!("f".repeat(64)));
    store.update(Table::Drugs, "D2", patch).await.unwrap();
    assert!(!manager.verify_drug("D2").await.unwrap());

    assert!(matches!(
        manager.verify_drug("D404").await,
        Err(Error::DrugNotFound(_))
    ));
}

#[tokio::test]
async fn test_store_failure_is_replayed() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    store.fail_writes(Table::Drugs, 1);
    let err = manager.create_drug(drug("D1", "M1")).await.unwrap_err();
    assert!(matches!(err, Error::ExternalStore(_)));
    assert!(err.is_retryable());

    // Chain and ledgers are ahead of the store
    assert_eq!(manager.chain_status().await.unwrap().block_height, 1);
    assert!(manager.ledgers().common().drug("D1").is_some());
    assert!(store.is_empty(Table::Drugs));

    let report = manager.consistency_check().await;
    assert_eq!(report.status, ConsistencyStatus::Inconsistent);
    assert_eq!(report.recommendation.as_deref(), Some(REPLAY_RECOMMENDATION));
    assert!(report.error.unwrap().contains("create_drug"));

    let summary = manager.reconcile().await;
    assert_eq!(summary.replayed, 1);
    assert_eq!(summary.failed, 0);

    assert!(manager.consistency_check().await.is_consistent());
    assert_eq!(manager.chain_status().await.unwrap().block_height, 1);
    let row = drug_row(&store, "D1").await;
    let blocks = manager.chain().blocks().await.unwrap();
    assert_eq!(row.blockchain_tx_id, blocks[0].tx_hash);
    assert_eq!(store.len(Table::DrugStatusUpdates), 1);
    assert_eq!(manager.drug_history("D1").unwrap().len(), 1);
    assert!(manager.verify_drug("D1").await.unwrap());
}

#[tokio::test]
async fn test_pending_intent_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());

    {
        let manager = open(dir.path(), &store).await;
        manager.create_drug(drug("D1", "M1")).await.unwrap();
        store.fail_writes(Table::Shipments, 1);
        assert!(manager
            .create_shipment(shipment("S1", "D1", "M1"))
            .await
            .is_err());
        manager.shutdown().await.unwrap();
    }

    let manager = open(dir.path(), &store).await;
    assert_eq!(manager.pending_intents().len(), 1);
    assert_eq!(manager.chain_status().await.unwrap().block_height, 3);

    let summary = manager.reconcile().await;
    assert_eq!(summary.replayed, 1);

    assert_eq!(manager.chain_status().await.unwrap().block_height, 3);
    assert_eq!(drug_row(&store, "D1").await.status, "in_transit");
    assert_eq!(store.len(Table::Shipments), 1);
    assert_eq!(store.len(Table::ShipmentStatusUpdates), 1);
    assert_eq!(store.len(Table::DrugStatusUpdates), 2);
    assert_eq!(
        statuses(&manager.drug_history("D1").unwrap()),
        vec!["created", "in_transit"]
    );
    assert!(manager.consistency_check().await.is_consistent());
}

#[tokio::test]
async fn test_unclosed_intent_is_replayed_before_revert() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    store.fail_writes(Table::Drugs, 1);
    assert!(manager
        .create_shipment(shipment("S1", "D1", "M1"))
        .await
        .is_err());
    assert_eq!(manager.pending_intents().len(), 1);

    // The shipment's drug write lands first, then the revert on top of it
    let revert_hash = manager.revert_drug(revert("D1")).await.unwrap();
    assert!(manager.pending_intents().is_empty());

    let row = drug_row(&store, "D1").await;
    assert_eq!(row.status, "reverted");
    assert_eq!(row.blockchain_tx_id, revert_hash);

    let summary = manager.reconcile().await;
    assert_eq!(summary.replayed, 0);

    let row = drug_row(&store, "D1").await;
    assert_eq!(row.status, "reverted");
    assert_eq!(row.blockchain_tx_id, revert_hash);
    assert_eq!(
        statuses(&manager.drug_history("D1").unwrap()),
        vec!["created", "in_transit", "reverted"]
    );
    assert_eq!(store.len(Table::DrugStatusUpdates), 3);
    assert_eq!(manager.chain_status().await.unwrap().block_height, 4);
    assert!(manager.consistency_check().await.is_consistent());
}

#[tokio::test]
async fn test_operation_waits_for_failing_intent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = open(dir.path(), &store).await;

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    store.fail_writes(Table::Drugs, 2);
    assert!(manager
        .create_shipment(shipment("S1", "D1", "M1"))
        .await
        .is_err());

    // Replay hits the second failure, so the revert never starts
    let err = manager.revert_drug(revert("D1")).await.unwrap_err();
    assert!(matches!(err, Error::ExternalStore(_)));
    assert_eq!(manager.chain_status().await.unwrap().block_height, 3);
    assert_eq!(manager.pending_intents().len(), 1);
    assert_eq!(
        manager.ledgers().common().drug("D1").unwrap().record.current_status,
        DrugStatus::InTransit
    );

    // Unrelated entities are not held back
    manager.create_drug(drug("D2", "M1")).await.unwrap();

    assert_eq!(manager.reconcile().await.replayed, 1);
    manager.revert_drug(revert("D1")).await.unwrap();
    assert_eq!(drug_row(&store, "D1").await.status, "reverted");
    assert!(manager.consistency_check().await.is_consistent());
}

#[tokio::test]
async fn test_concurrent_operations_keep_chain_consistent() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(open(dir.path(), &store).await);

    let mut handles = Vec::new();
    for i in 0..8 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            let drug_id = format!("D{}", i);
            let shipment_id = format!("S{}", i);
            manager.create_drug(drug(&drug_id, "M1")).await.unwrap();
            manager
                .create_shipment(shipment(&shipment_id, &drug_id, "M1"))
                .await
                .unwrap();
            manager
                .update_shipment_status(move_shipment(&shipment_id, "delivered"))
                .await
                .unwrap();
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    // 5 transactions per drug
    assert_eq!(manager.chain_status().await.unwrap().block_height, 40);
    assert!(manager.consistency_check().await.is_consistent());

    let mfr = manager.ledgers().manufacturer("M1").unwrap();
    assert_eq!(mfr.drugs.len(), 8);
    assert!(mfr
        .drugs
        .iter()
        .all(|d| d.current_status == DrugStatus::Delivered));
    assert_eq!(manager.distributor_shipments("DIST-1").len(), 8);
}

#[tokio::test]
async fn test_same_shipment_updates_serialize() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());
    let manager = Arc::new(open(dir.path(), &store).await);

    manager.create_drug(drug("D1", "M1")).await.unwrap();
    manager.create_shipment(shipment("S1", "D1", "M1")).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..6 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .update_shipment_status(move_shipment("S1", "in_transit"))
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    // History only grows, one entry per accepted update
    let history = manager.shipment_history("S1").unwrap();
    assert_eq!(history.len(), 7);
    assert!(history.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    assert_eq!(manager.shipment_status_updates("S1").await.unwrap().len(), 7);
}
