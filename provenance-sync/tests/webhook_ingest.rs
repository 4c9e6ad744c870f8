//! Webhook ingest tests against the in-memory store

use provenance_ledger::{ExternalStore, LedgerManager, MemoryStore, Row, Table};
use provenance_sync::snapshot::is_tombstone;
use provenance_sync::{Config, Error, SyncNode};
use serde_json::{json, Value};
use std::sync::Arc;

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<MemoryStore>,
    node: SyncNode,
}

async fn harness(tune: impl FnOnce(&mut Config)) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(MemoryStore::new());

    let mut ledger_config = provenance_ledger::Config::default();
    ledger_config.data_dir = dir.path().join("ledger");
    let manager = LedgerManager::open(ledger_config, store.clone() as Arc<dyn ExternalStore>)
        .await
        .unwrap();

    let mut config = Config::default();
    config.data_dir = dir.path().join("sync");
    config.webhook.backoff_unit_ms = 5;
    tune(&mut config);

    let node = SyncNode::new(config, Arc::new(manager)).unwrap();
    Harness {
        _dir: dir,
        store,
        node,
    }
}

fn drug_record(drug_id: &str, tx_id: &str) -> Value {
    json!({
        "drug_id": drug_id,
        "manufacturer_id": "M1",
        "name": "Ibuprofen",
        "description": "200mg tablets",
        "status": "created",
        "blockchain_tx_id": tx_id,
        "created_at": "2024-05-01T10:00:00Z",
        "updated_at": "2024-05-01T10:00:00Z"
    })
}

fn body(event_type: &str, table: &str, record: Value) -> Vec<u8> {
    let key = if event_type == "DELETE" { "old_record" } else { "record" };
    serde_json::to_vec(&json!({
        "type": event_type,
        "table": table,
        key: record,
        "schema": "public"
    }))
    .unwrap()
}

async fn height(node: &SyncNode) -> u64 {
    node.manager.chain_status().await.unwrap().block_height
}

#[tokio::test]
async fn test_duplicate_insert_is_processed_once() {
    let h = harness(|_| {}).await;
    let before = height(&h.node).await;

    let event = body("INSERT", "drugs", drug_record("D1", "pending"));
    h.node.webhook.submit(None, &event).unwrap();
    h.node.webhook.submit(None, &event).unwrap();
    h.node.webhook.shutdown().await;

    assert_eq!(height(&h.node).await, before + 1);
    assert_eq!(h.node.snapshots.files_for(Table::Drugs, "D1").unwrap().len(), 1);
    assert_eq!(h.node.metrics.event_count("persisted"), 1);
    assert_eq!(h.node.metrics.event_count("duplicate"), 1);
    assert!(h.node.state.last_sync(Table::Drugs).is_some());
}

#[tokio::test]
async fn test_insert_writes_hash_back_to_store() {
    let h = harness(|_| {}).await;
    let record = drug_record("D2", "");
    let row: Row = record.as_object().cloned().unwrap();
    h.store.insert(Table::Drugs, row).await.unwrap();

    h.node.webhook.submit(None, &body("INSERT", "drugs", record)).unwrap();
    h.node.webhook.shutdown().await;

    let rows = h
        .store
        .select(Table::Drugs, "*", &provenance_ledger::external::eq("drug_id", "D2"))
        .await
        .unwrap();
    let tx_id = rows[0]["blockchain_tx_id"].as_str().unwrap().to_string();
    assert_eq!(tx_id.len(), 64);
    assert!(h.node.tracker.is_processed(&tx_id));
    assert!(h.node.manager.verify_transaction(&tx_id).await.unwrap().valid);
}

#[tokio::test]
async fn test_update_echo_is_duplicate() {
    let h = harness(|_| {}).await;
    let row: Row = drug_record("D3", "pending").as_object().cloned().unwrap();
    h.store.insert(Table::Drugs, row).await.unwrap();

    // The store row is anchored by a sync pass; its write-back arrives as an UPDATE
    h.node.engine.sync_table(Table::Drugs).await;
    let rows = h.store.select(Table::Drugs, "*", &Vec::new()).await.unwrap();
    let tx_id = rows[0]["blockchain_tx_id"].as_str().unwrap().to_string();
    let before = height(&h.node).await;

    h.node
        .webhook
        .submit(None, &body("UPDATE", "drugs", drug_record("D3", &tx_id)))
        .unwrap();
    h.node.webhook.shutdown().await;

    assert_eq!(height(&h.node).await, before);
    assert_eq!(h.node.metrics.event_count("duplicate"), 1);
    assert!(h.node.snapshots.files_for(Table::Drugs, "D3").unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_writes_tombstone() {
    let h = harness(|_| {}).await;
    let before = height(&h.node).await;

    h.node
        .webhook
        .submit(None, &body("DELETE", "shipments", json!({"shipment_id": "S9", "status": "failed"})))
        .unwrap();
    h.node.webhook.shutdown().await;

    let files = h.node.snapshots.files_for(Table::Shipments, "S9").unwrap();
    assert_eq!(files.len(), 1);
    assert!(is_tombstone(&files[0]));

    let tombstone: Value = serde_json::from_slice(&std::fs::read(&files[0]).unwrap()).unwrap();
    assert_eq!(tombstone["original_record"]["shipment_id"], "S9");
    assert!(tombstone["deleted_at"].is_string());
    assert_eq!(height(&h.node).await, before);
}

#[tokio::test]
async fn test_signature_checked_when_secret_set() {
    let h = harness(|c| c.webhook.secret = Some("s3cret".into())).await;
    let event = body("INSERT", "drugs", drug_record("D4", "pending"));

    assert!(matches!(h.node.webhook.submit(None, &event), Err(Error::InvalidSignature)));
    assert!(matches!(h.node.webhook.submit(Some(""), &event), Err(Error::InvalidSignature)));
    assert!(matches!(
        h.node.webhook.submit(Some("s3cret-not"), &event),
        Err(Error::InvalidSignature)
    ));
    assert!(h.node.webhook.submit(Some("s3cret"), &event).is_ok());
    assert_eq!(h.node.metrics.event_count("rejected"), 3);

    h.node.webhook.shutdown().await;
}

#[tokio::test]
async fn test_rejects_unsupported_table_and_bad_body() {
    let h = harness(|_| {}).await;

    let users = body("INSERT", "users", json!({"id": 1}));
    assert!(matches!(h.node.webhook.submit(None, &users), Err(Error::UnsupportedTable(t)) if t == "users"));
    assert!(matches!(h.node.webhook.submit(None, b"not json"), Err(Error::InvalidPayload(_))));

    let no_key = body("INSERT", "drugs", json!({"name": "x"}));
    assert!(matches!(h.node.webhook.submit(None, &no_key), Err(Error::InvalidPayload(_))));

    h.node.webhook.shutdown().await;
}

#[tokio::test]
async fn test_exhausted_retries_are_dead_lettered() {
    let h = harness(|c| c.webhook.max_retries = 2).await;
    let record = drug_record("D5", "pending");
    let row: Row = record.as_object().cloned().unwrap();
    h.store.insert(Table::Drugs, row).await.unwrap();
    h.store.fail_writes(Table::Drugs, 10);
    let before = height(&h.node).await;

    let id = h.node.webhook.submit(None, &body("INSERT", "drugs", record)).unwrap();
    h.node.webhook.shutdown().await;

    let letters = h.node.dlq.list().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].id, id);
    assert_eq!(letters[0].attempts, 2);
    assert!(letters[0].failure_reason.contains("injected write failure"));
    assert_eq!(letters[0].event.table, "drugs");

    // The retry reused the appended transaction
    assert_eq!(height(&h.node).await, before + 1);
    assert_eq!(h.node.metrics.event_count("dead_lettered"), 1);
}

#[tokio::test]
async fn test_non_retryable_failure_skips_retries() {
    let h = harness(|c| c.webhook.max_retries = 5).await;

    // Passes intake validation but cannot be turned into a chain payload
    let event = body("INSERT", "shipments", json!({"shipment_id": "S1"}));
    h.node.webhook.submit(None, &event).unwrap();
    h.node.webhook.shutdown().await;

    let letters = h.node.dlq.list().unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 1);
}

#[tokio::test]
async fn test_full_queue_reports_backpressure() {
    // Single-threaded runtime: workers cannot drain until this task yields
    let h = harness(|c| {
        c.webhook.workers = 1;
        c.webhook.queue_capacity = 2;
    })
    .await;

    let first = body("INSERT", "drugs", drug_record("Q1", "pending"));
    let second = body("INSERT", "drugs", drug_record("Q2", "pending"));
    let third = body("INSERT", "drugs", drug_record("Q3", "pending"));

    h.node.webhook.submit(None, &first).unwrap();
    h.node.webhook.submit(None, &second).unwrap();
    assert_eq!(h.node.webhook.queued(), 2);
    assert!(matches!(h.node.webhook.submit(None, &third), Err(Error::QueueFull(2))));

    h.node.webhook.shutdown().await;
    assert_eq!(h.node.metrics.event_count("persisted"), 2);
    assert!(h.node.dlq.list().unwrap().is_empty());
}

#[tokio::test]
async fn test_submit_after_shutdown_fails() {
    let h = harness(|_| {}).await;
    h.node.webhook.shutdown().await;

    let event = body("INSERT", "drugs", drug_record("D6", "pending"));
    assert!(matches!(h.node.webhook.submit(None, &event), Err(Error::NotRunning)));
    assert!(h.node.snapshots.files_for(Table::Drugs, "D6").unwrap().is_empty());
}
