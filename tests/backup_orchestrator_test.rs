// Backup orchestration against in-memory stores

mod common;

use common::*;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;

use tristore::artifact::{ArtifactStore, MemoryArtifactStore};
use tristore::driver::{DriverRegistry, FaultPlan, StoreDriver};
use tristore::integrity::Checksum;
use tristore::ledger::{BackupLedger, LedgerQuery};
use tristore::orchestrator::{BackupOptions, BackupPhase, RestoreRequest};
use tristore::types::{BackupStatus, StorageKey, StoreKind};
use tristore::{BackupError, Tristore};

#[tokio::test]
async fn test_backup_stores_artifact_with_matching_checksum() {
    let db = shop_database();
    let harness = Harness::new(DriverRegistry::new().with(relational_driver(&db)));

    let outcome = harness.tristore.backup(StoreKind::Relational).await;
    assert!(outcome.is_success(), "{:?}", outcome.error());
    assert_eq!(outcome.phase, BackupPhase::Succeeded);

    let record = outcome.result.unwrap();
    assert_eq!(record.status, BackupStatus::Succeeded);
    assert!(record.completed_at.unwrap() >= record.started_at);

    let key = record.storage_key.clone().unwrap();
    let parsed = StorageKey::parse(&key).unwrap();
    assert_eq!(parsed.store_kind, StoreKind::Relational);
    assert_eq!(parsed.id, record.id);

    let stored = harness.store.get(&key).await.unwrap();
    assert_eq!(record.size_bytes, Some(stored.len() as u64));
    assert_eq!(record.checksum, Some(Checksum::of(&stored)));
}

#[tokio::test]
async fn test_concurrent_backup_of_same_kind_conflicts() {
    let graph = people_graph();
    let gated = GatedDriver::new(graph_driver(&graph));
    let harness = Harness::new(DriverRegistry::new().with(gated.clone() as Arc<dyn StoreDriver>));

    let first = harness.tristore.backup(StoreKind::Graph);
    let second = async {
        gated.started.notified().await;
        let outcome = harness.tristore.backup(StoreKind::Graph).await;

        let in_flight = harness
            .ledger
            .query(&LedgerQuery::all().kind(StoreKind::Graph))
            .await
            .unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].status, BackupStatus::Running);

        gated.gate.notify_one();
        outcome
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_success());
    assert_eq!(second.phase, BackupPhase::Requested);
    assert!(second.record_id.is_none());
    assert!(matches!(second.error(), Some(BackupError::Conflict(StoreKind::Graph))));

    let records = harness.ledger.query(&LedgerQuery::all()).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, BackupStatus::Succeeded);
}

#[tokio::test]
async fn test_other_kinds_run_while_one_is_in_flight() {
    let graph = people_graph();
    let db = shop_database();
    let gated = GatedDriver::new(graph_driver(&graph));
    let harness = Harness::new(
        DriverRegistry::new()
            .with(gated.clone() as Arc<dyn StoreDriver>)
            .with(relational_driver(&db)),
    );

    let graph_run = harness.tristore.backup(StoreKind::Graph);
    let relational_run = async {
        gated.started.notified().await;
        let outcome = harness.tristore.backup(StoreKind::Relational).await;
        gated.gate.notify_one();
        outcome
    };
    let (graph_outcome, relational_outcome) = tokio::join!(graph_run, relational_run);

    assert!(graph_outcome.is_success());
    assert!(relational_outcome.is_success());
}

#[tokio::test]
async fn test_disconnect_mid_capture_fails_record_and_leaves_no_artifact() {
    let index = documents_index(10).await;
    index.set_faults(FaultPlan::disconnect_after(2));
    let harness = Harness::new(DriverRegistry::new().with(vector_driver(&index, small_pages())));

    let outcome = harness.tristore.backup(StoreKind::Vector).await;
    assert_eq!(outcome.phase, BackupPhase::Capturing);
    assert!(matches!(
        outcome.error(),
        Some(BackupError::Capture {
            kind: StoreKind::Vector,
            ..
        })
    ));

    let record = harness.ledger.get(outcome.record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert!(record.error_detail.as_deref().unwrap_or_default().contains("connection reset"));
    assert!(record.storage_key.is_none());
    assert!(record.checksum.is_none());

    assert!(harness.store.list("vector/").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_write_during_capture_fails_backup() {
    let index = documents_index(10).await;
    index.set_faults(FaultPlan::concurrent_write_after(1));
    let harness = Harness::new(DriverRegistry::new().with(vector_driver(&index, small_pages())));

    let outcome = harness.tristore.backup(StoreKind::Vector).await;
    assert_eq!(outcome.phase, BackupPhase::Capturing);
    assert_eq!(outcome.status_label(), "capture");
    assert!(harness.store.is_empty());
}

#[tokio::test]
async fn test_timeout_cancels_capture() {
    let ledger_kind = StoreKind::Graph;
    let harness = Harness::new(DriverRegistry::new().with(Arc::new(StalledDriver::new(ledger_kind))));
    let tristore = harness
        .tristore
        .with_backup_options(BackupOptions::new().timeout(Duration::from_millis(50)));

    let outcome = tristore.backup(ledger_kind).await;
    assert_eq!(outcome.phase, BackupPhase::Capturing);
    assert!(matches!(outcome.error(), Some(BackupError::Timeout(_))));

    let record = harness.ledger.get(outcome.record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert!(harness.store.is_empty());

    // The failed run released the kind
    assert!(harness.ledger.begin(ledger_kind).await.is_ok());
}

#[tokio::test]
async fn test_backup_all_reports_each_kind() {
    let graph = people_graph();
    let db = shop_database();
    let index = documents_index(5).await;
    index.set_faults(FaultPlan::disconnect_after(0));

    let harness = Harness::new(
        DriverRegistry::new()
            .with(graph_driver(&graph))
            .with(relational_driver(&db))
            .with(vector_driver(&index, small_pages())),
    );

    let outcomes = harness.tristore.backup_all().await;
    assert_eq!(outcomes.len(), 3);

    let by_kind = |kind: StoreKind| outcomes.iter().find(|o| o.store_kind == kind).unwrap();
    assert!(!by_kind(StoreKind::Vector).is_success());
    assert!(by_kind(StoreKind::Graph).is_success());
    assert!(by_kind(StoreKind::Relational).is_success());

    let succeeded = harness
        .ledger
        .query(&LedgerQuery::all().status(BackupStatus::Succeeded))
        .await
        .unwrap();
    assert_eq!(succeeded.len(), 2);
}

#[tokio::test]
async fn test_success_committed_before_ledger_error_keeps_artifact() {
    let graph = people_graph();
    let ledger = Arc::new(FlakyLedger::new(true));
    let store = Arc::new(MemoryArtifactStore::new());
    let tristore = Tristore::new(ledger.clone(), store.clone(), DriverRegistry::new().with(graph_driver(&graph)));

    let outcome = tristore.backup(StoreKind::Graph).await;
    assert!(outcome.is_success(), "{:?}", outcome.error());
    assert_eq!(outcome.phase, BackupPhase::Succeeded);

    let record = ledger.get(outcome.record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Succeeded);
    let key = record.storage_key.unwrap();
    assert!(store.exists(&key).await.unwrap());

    let restored = tristore.restore(RestoreRequest::latest(StoreKind::Graph)).await;
    assert!(restored.is_success(), "{:?}", restored.error());
}

#[tokio::test]
async fn test_unrecorded_success_leaves_artifact_for_reconciliation() {
    let graph = people_graph();
    let ledger = Arc::new(FlakyLedger::new(false));
    let store = Arc::new(MemoryArtifactStore::new());
    let tristore = Tristore::new(ledger.clone(), store.clone(), DriverRegistry::new().with(graph_driver(&graph)));

    let outcome = tristore.backup(StoreKind::Graph).await;
    assert_eq!(outcome.phase, BackupPhase::Recording);
    assert_eq!(outcome.status_label(), "ledger");

    let record = ledger.get(outcome.record_id.unwrap()).await.unwrap().unwrap();
    assert_eq!(record.status, BackupStatus::Failed);
    assert!(record.storage_key.is_none());

    // Unreferenced now, so the sweeper's orphan pass owns it
    let keys = store.list("graph/").await.unwrap();
    assert_eq!(keys.len(), 1);
    assert_eq!(StorageKey::parse(&keys[0]).unwrap().id, record.id);
}
