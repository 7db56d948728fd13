// Restore orchestration: selection, validation gates and round trips

mod common;

use common::*;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

use tristore::artifact::ArtifactStore;
use tristore::driver::{DriverRegistry, FaultPlan, StoreDriver};
use tristore::orchestrator::{RestoreMode, RestorePhase, RestoreRequest};
use tristore::types::StoreKind;
use tristore::BackupError;

#[tokio::test]
async fn test_restore_without_backups_never_touches_the_store() {
    let graph = people_graph();
    let counting = CountingDriver::new(graph_driver(&graph));
    let harness = Harness::new(DriverRegistry::new().with(counting.clone() as Arc<dyn StoreDriver>));

    let outcome = harness.tristore.restore(RestoreRequest::latest(StoreKind::Graph)).await;
    assert_eq!(outcome.phase, RestorePhase::Resolving);
    assert!(matches!(outcome.error(), Some(BackupError::NoBackups(StoreKind::Graph))));
    assert!(outcome.record.is_none());
    assert_eq!(counting.restore_calls(), 0);
}

#[tokio::test]
async fn test_flipped_bit_is_caught_before_restore() {
    let graph = people_graph();
    let counting = CountingDriver::new(graph_driver(&graph));
    let harness = Harness::new(DriverRegistry::new().with(counting.clone() as Arc<dyn StoreDriver>));

    let record = harness.tristore.backup(StoreKind::Graph).await.result.unwrap();
    let key = record.storage_key.clone().unwrap();
    assert!(harness.store.tamper(&key, |bytes| {
        let middle = bytes.len() / 2;
        bytes[middle] ^= 0x01;
    }));

    let outcome = harness.tristore.restore(RestoreRequest::latest(StoreKind::Graph)).await;
    assert_eq!(outcome.phase, RestorePhase::Validating);
    match outcome.error() {
        Some(BackupError::ChecksumMismatch { key: reported, expected, actual }) => {
            assert_eq!(reported, &key);
            assert_eq!(Some(expected), record.checksum.as_ref());
            assert_ne!(expected, actual);
        }
        other => panic!("expected checksum mismatch, got {:?}", other),
    }
    assert_eq!(counting.restore_calls(), 0);
}

#[tokio::test]
async fn test_truncated_artifact_is_caught_in_validate_only_mode() {
    let db = shop_database();
    let harness = Harness::new(DriverRegistry::new().with(relational_driver(&db)));

    let record = harness.tristore.backup(StoreKind::Relational).await.result.unwrap();
    let key = record.storage_key.unwrap();
    harness.store.tamper(&key, |bytes| bytes.truncate(bytes.len() / 2));

    let outcome = harness
        .tristore
        .restore(RestoreRequest::latest(StoreKind::Relational).validate_only())
        .await;
    assert_eq!(outcome.phase, RestorePhase::Validating);
    assert!(matches!(outcome.error(), Some(BackupError::ChecksumMismatch { .. })));
}

#[tokio::test]
async fn test_validate_only_leaves_target_unchanged() {
    let db = shop_database();
    let counting = CountingDriver::new(relational_driver(&db));
    let harness = Harness::new(DriverRegistry::new().with(counting.clone() as Arc<dyn StoreDriver>));

    harness.tristore.backup(StoreKind::Relational).await.result.unwrap();
    db.insert(
        "customers",
        [("id".to_string(), json!(3)), ("name".to_string(), json!("Cy"))].into(),
    )
    .unwrap();
    let before = db.rows("customers");

    let outcome = harness
        .tristore
        .restore(RestoreRequest::latest(StoreKind::Relational).validate_only())
        .await;
    assert!(outcome.is_success());
    assert_eq!(outcome.phase, RestorePhase::ValidatedOnly);
    assert_eq!(outcome.mode, RestoreMode::ValidateOnly);
    assert!(outcome.check.is_none());
    assert_eq!(counting.restore_calls(), 0);
    assert_eq!(db.rows("customers"), before);
}

#[tokio::test]
async fn test_relational_round_trip_restores_captured_rows() {
    let db = shop_database();
    let harness = Harness::new(DriverRegistry::new().with(relational_driver(&db)));
    let driver = relational_driver(&db);

    let captured = driver.fingerprint().await.unwrap();
    harness.tristore.backup(StoreKind::Relational).await.result.unwrap();

    db.insert(
        "orders",
        [
            ("id".to_string(), json!(13)),
            ("customer_id".to_string(), json!(2)),
            ("total".to_string(), json!(1.0)),
        ]
        .into(),
    )
    .unwrap();
    assert_ne!(driver.fingerprint().await.unwrap(), captured);

    let outcome = harness.tristore.restore(RestoreRequest::latest(StoreKind::Relational)).await;
    assert!(outcome.is_success(), "{:?}", outcome.error());
    assert_eq!(outcome.phase, RestorePhase::Succeeded);
    assert_eq!(db.row_count("orders"), 3);
    assert_eq!(driver.fingerprint().await.unwrap(), captured);

    let check = outcome.check.unwrap();
    assert!(check.matches);
    assert_eq!(check.observed, captured);
}

#[tokio::test]
async fn test_backup_after_restore_reproduces_the_restored_artifact() {
    let db = shop_database();
    let harness = Harness::new(DriverRegistry::new().with(relational_driver(&db)));
    let driver = relational_driver(&db);

    let original = harness.tristore.backup(StoreKind::Relational).await.result.unwrap();
    db.insert(
        "customers",
        [("id".to_string(), json!(40)), ("name".to_string(), json!("Mallory"))].into(),
    )
    .unwrap();

    let restored = harness.tristore.restore(RestoreRequest::latest(StoreKind::Relational)).await;
    assert!(restored.is_success(), "{:?}", restored.error());
    assert_eq!(restored.record.as_ref().map(|r| r.id), Some(original.id));

    let fresh = harness.tristore.backup(StoreKind::Relational).await.result.unwrap();
    assert_ne!(fresh.id, original.id);

    let original_bytes = harness.store.get(original.storage_key.as_deref().unwrap()).await.unwrap();
    let fresh_bytes = harness.store.get(fresh.storage_key.as_deref().unwrap()).await.unwrap();
    let before = driver.inspect(&original_bytes).await.unwrap();
    let after = driver.inspect(&fresh_bytes).await.unwrap();

    assert_eq!(after.fingerprint, before.fingerprint);
    assert_eq!(after.entries, before.entries);
}

#[tokio::test]
async fn test_vector_round_trip_into_empty_index() {
    let source = documents_index(7).await;
    let harness = Harness::new(DriverRegistry::new().with(vector_driver(&source, small_pages())));
    let record = harness.tristore.backup(StoreKind::Vector).await.result.unwrap();
    let payload = harness.store.get(record.storage_key.as_deref().unwrap()).await.unwrap();

    let target = tristore::driver::MemoryVectorIndex::new();
    let target_driver = vector_driver(&target, small_pages());
    let summary = target_driver.restore(payload).await.unwrap();

    assert_eq!(summary.fingerprint, vector_driver(&source, small_pages()).fingerprint().await.unwrap());
    assert_eq!(target_driver.fingerprint().await.unwrap(), summary.fingerprint);
}

#[tokio::test]
async fn test_latest_selects_most_recent_backup() {
    let graph = people_graph();
    let harness = Harness::new(DriverRegistry::new().with(graph_driver(&graph)));
    let driver = graph_driver(&graph);

    harness.tristore.backup(StoreKind::Graph).await.result.unwrap();
    graph.add_node(&["Person"], [("name".to_string(), json!("Cy"))].into());
    let second_state = driver.fingerprint().await.unwrap();
    let second = harness.tristore.backup(StoreKind::Graph).await.result.unwrap();

    graph.add_node(&["Person"], [("name".to_string(), json!("Dee"))].into());

    let outcome = harness.tristore.restore(RestoreRequest::latest(StoreKind::Graph)).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.record.unwrap().id, second.id);
    assert_eq!(driver.fingerprint().await.unwrap(), second_state);
}

#[tokio::test]
async fn test_explicit_selector_restores_older_backup() {
    let graph = people_graph();
    let harness = Harness::new(DriverRegistry::new().with(graph_driver(&graph)));
    let driver = graph_driver(&graph);

    let first_state = driver.fingerprint().await.unwrap();
    let first = harness.tristore.backup(StoreKind::Graph).await.result.unwrap();
    graph.add_node(&["Person"], [("name".to_string(), json!("Cy"))].into());
    harness.tristore.backup(StoreKind::Graph).await.result.unwrap();

    let outcome = harness
        .tristore
        .restore(RestoreRequest::explicit(StoreKind::Graph, first.id))
        .await;
    assert!(outcome.is_success());
    assert_eq!(driver.fingerprint().await.unwrap(), first_state);
}

#[tokio::test]
async fn test_rejected_write_is_a_restore_error() {
    let graph = people_graph();
    let harness = Harness::new(DriverRegistry::new().with(graph_driver(&graph)));
    harness.tristore.backup(StoreKind::Graph).await.result.unwrap();

    graph.set_faults(FaultPlan::reject_writes());
    let outcome = harness.tristore.restore(RestoreRequest::latest(StoreKind::Graph)).await;
    assert_eq!(outcome.phase, RestorePhase::Restoring);
    assert!(matches!(
        outcome.error(),
        Some(BackupError::Restore {
            kind: StoreKind::Graph,
            ..
        })
    ));
}

#[tokio::test]
async fn test_restore_all_reports_each_kind_independently() {
    let graph = people_graph();
    let db = shop_database();
    let harness = Harness::new(
        DriverRegistry::new()
            .with(graph_driver(&graph))
            .with(relational_driver(&db)),
    );
    harness.tristore.backup(StoreKind::Graph).await.result.unwrap();

    let outcomes = harness.tristore.restore_all(RestoreMode::ValidateOnly).await;
    assert_eq!(outcomes.len(), 2);
    let graph_outcome = outcomes.iter().find(|o| o.store_kind == StoreKind::Graph).unwrap();
    let relational_outcome = outcomes.iter().find(|o| o.store_kind == StoreKind::Relational).unwrap();
    assert_eq!(graph_outcome.phase, RestorePhase::ValidatedOnly);
    assert!(matches!(relational_outcome.error(), Some(BackupError::NoBackups(StoreKind::Relational))));
}
