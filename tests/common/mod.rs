// Shared fixtures for the integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use tristore::artifact::MemoryArtifactStore;
use tristore::driver::vector::VectorParams;
use tristore::driver::{
    ArtifactStream, ArtifactSummary, CollectionConfig, Distance, DriverError, DriverOptions, DriverRegistry,
    GraphDriver, MemoryGraph, MemoryRelational, MemoryVectorIndex, RelationalDriver, RestoreSummary, StoreDriver,
    TableSchema, VectorDriver, VectorIndexClient, VectorPoint,
};
use tristore::integrity::Fingerprint;
use tristore::ledger::{BackupLedger, LedgerError, LedgerQuery, MemoryLedger};
use tristore::types::{BackupRecord, Completion, RecordId, StoreKind};
use tristore::Tristore;

/// In-memory ledger and artifact store behind a facade
pub struct Harness {
    pub ledger: Arc<MemoryLedger>,
    pub store: Arc<MemoryArtifactStore>,
    pub tristore: Tristore,
}

impl Harness {
    pub fn new(drivers: DriverRegistry) -> Self {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryArtifactStore::new());
        let tristore = Tristore::new(ledger.clone(), store.clone(), drivers);
        Self { ledger, store, tristore }
    }
}

pub fn small_pages() -> DriverOptions {
    DriverOptions {
        page_size: 2,
        ..DriverOptions::default()
    }
}

pub fn people_graph() -> MemoryGraph {
    let graph = MemoryGraph::new();
    let ada = graph.add_node(&["Person"], [("name".to_string(), json!("Ada"))].into());
    let bob = graph.add_node(&["Person", "Admin"], [("name".to_string(), json!("Bob"))].into());
    let acme = graph.add_node(&["Company"], [("name".to_string(), json!("Acme"))].into());
    graph.add_relationship(ada, bob, "KNOWS", [("since".to_string(), json!(2019))].into());
    graph.add_relationship(bob, acme, "WORKS_AT", Default::default());
    graph
}

pub async fn documents_index(points: u64) -> MemoryVectorIndex {
    let index = MemoryVectorIndex::new();
    index
        .create_collection(&CollectionConfig::new("documents", VectorParams::new(3, Distance::Cosine)))
        .await
        .unwrap();
    let points: Vec<VectorPoint> = (0..points)
        .map(|i| VectorPoint {
            id: tristore::driver::vector::PointId::Num(i),
            vector: json!([i as f64, 0.5, 1.0]),
            payload: [("title".to_string(), json!(format!("doc {}", i)))].into(),
        })
        .collect();
    index.upsert("documents", &points).await.unwrap();
    index
}

pub fn shop_schema() -> Vec<TableSchema> {
    vec![
        TableSchema::new("customers")
            .column("id", "integer", false)
            .column("name", "text", false)
            .primary_key(&["id"]),
        TableSchema::new("orders")
            .column("id", "integer", false)
            .column("customer_id", "integer", false)
            .column("total", "numeric", true)
            .primary_key(&["id"])
            .foreign_key(&["customer_id"], "customers", &["id"]),
    ]
}

pub fn shop_database() -> MemoryRelational {
    let db = MemoryRelational::new(shop_schema());
    for (id, name) in [(1, "Ada"), (2, "Bob")] {
        db.insert("customers", [("id".to_string(), json!(id)), ("name".to_string(), json!(name))].into())
            .unwrap();
    }
    for (id, customer, total) in [(10, 1, 9.5), (11, 1, 20.0), (12, 2, 3.25)] {
        db.insert(
            "orders",
            [
                ("id".to_string(), json!(id)),
                ("customer_id".to_string(), json!(customer)),
                ("total".to_string(), json!(total)),
            ]
            .into(),
        )
        .unwrap();
    }
    db
}

pub fn graph_driver(graph: &MemoryGraph) -> Arc<dyn StoreDriver> {
    Arc::new(GraphDriver::new(Arc::new(graph.clone()), DriverOptions::default()))
}

pub fn vector_driver(index: &MemoryVectorIndex, options: DriverOptions) -> Arc<dyn StoreDriver> {
    Arc::new(VectorDriver::new(Arc::new(index.clone()), options))
}

pub fn relational_driver(db: &MemoryRelational) -> Arc<dyn StoreDriver> {
    Arc::new(RelationalDriver::new(Arc::new(db.clone()), DriverOptions::default()))
}

/// Counts calls into the wrapped driver
pub struct CountingDriver {
    inner: Arc<dyn StoreDriver>,
    pub captures: AtomicUsize,
    pub restores: AtomicUsize,
}

impl CountingDriver {
    pub fn new(inner: Arc<dyn StoreDriver>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            captures: AtomicUsize::new(0),
            restores: AtomicUsize::new(0),
        })
    }

    pub fn restore_calls(&self) -> usize {
        self.restores.load(Ordering::SeqCst)
    }

    pub fn capture_calls(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StoreDriver for CountingDriver {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn artifact_extension(&self) -> &'static str {
        self.inner.artifact_extension()
    }

    fn capture(&self) -> ArtifactStream {
        self.captures.fetch_add(1, Ordering::SeqCst);
        self.inner.capture()
    }

    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        self.inner.restore(artifact).await
    }

    async fn fingerprint(&self) -> Result<Fingerprint, DriverError> {
        self.inner.fingerprint().await
    }

    async fn inspect(&self, artifact: &Bytes) -> Result<ArtifactSummary, DriverError> {
        self.inner.inspect(artifact).await
    }
}

/// Holds every capture at its first poll until the gate opens
pub struct GatedDriver {
    inner: Arc<dyn StoreDriver>,
    pub started: Arc<Notify>,
    pub gate: Arc<Notify>,
}

impl GatedDriver {
    pub fn new(inner: Arc<dyn StoreDriver>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            started: Arc::new(Notify::new()),
            gate: Arc::new(Notify::new()),
        })
    }
}

#[async_trait]
impl StoreDriver for GatedDriver {
    fn kind(&self) -> StoreKind {
        self.inner.kind()
    }

    fn artifact_extension(&self) -> &'static str {
        self.inner.artifact_extension()
    }

    fn capture(&self) -> ArtifactStream {
        let inner = self.inner.capture();
        let started = Arc::clone(&self.started);
        let gate = Arc::clone(&self.gate);
        stream::once(async move {
            started.notify_one();
            gate.notified().await;
            inner
        })
        .flatten()
        .boxed()
    }

    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        self.inner.restore(artifact).await
    }

    async fn fingerprint(&self) -> Result<Fingerprint, DriverError> {
        self.inner.fingerprint().await
    }

    async fn inspect(&self, artifact: &Bytes) -> Result<ArtifactSummary, DriverError> {
        self.inner.inspect(artifact).await
    }
}

/// A driver whose capture stalls, optionally after one chunk
pub struct StalledDriver {
    kind: StoreKind,
    lead: Option<Bytes>,
}

impl StalledDriver {
    pub fn new(kind: StoreKind) -> Self {
        Self { kind, lead: None }
    }

    pub fn after_chunk(kind: StoreKind, chunk: &'static [u8]) -> Self {
        Self {
            kind,
            lead: Some(Bytes::from_static(chunk)),
        }
    }
}

#[async_trait]
impl StoreDriver for StalledDriver {
    fn kind(&self) -> StoreKind {
        self.kind
    }

    fn artifact_extension(&self) -> &'static str {
        "jsonl.gz"
    }

    fn capture(&self) -> ArtifactStream {
        stream::iter(self.lead.clone().map(Ok))
            .chain(stream::pending::<Result<Bytes, DriverError>>())
            .boxed()
    }

    async fn restore(&self, _artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        Err(DriverError::Unsupported("stalled driver cannot restore".to_string()))
    }

    async fn fingerprint(&self) -> Result<Fingerprint, DriverError> {
        Err(DriverError::Unavailable("stalled".to_string()))
    }

    async fn inspect(&self, _artifact: &Bytes) -> Result<ArtifactSummary, DriverError> {
        Err(DriverError::Unsupported("stalled driver cannot inspect".to_string()))
    }
}

/// A ledger whose `complete` reports a storage error, after or instead of
/// committing the write
pub struct FlakyLedger {
    pub inner: Arc<MemoryLedger>,
    pub commit_before_error: bool,
}

impl FlakyLedger {
    pub fn new(commit_before_error: bool) -> Self {
        Self {
            inner: Arc::new(MemoryLedger::new()),
            commit_before_error,
        }
    }
}

#[async_trait]
impl BackupLedger for FlakyLedger {
    async fn begin(&self, kind: StoreKind) -> Result<BackupRecord, LedgerError> {
        self.inner.begin(kind).await
    }

    async fn mark_running(&self, id: RecordId) -> Result<BackupRecord, LedgerError> {
        self.inner.mark_running(id).await
    }

    async fn complete(&self, id: RecordId, completion: Completion) -> Result<BackupRecord, LedgerError> {
        if self.commit_before_error {
            self.inner.complete(id, completion).await?;
        }
        Err(LedgerError::Storage("connection closed".to_string()))
    }

    async fn fail(&self, id: RecordId, detail: &str) -> Result<BackupRecord, LedgerError> {
        self.inner.fail(id, detail).await
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<BackupRecord>, LedgerError> {
        self.inner.query(query).await
    }

    async fn get(&self, id: RecordId) -> Result<Option<BackupRecord>, LedgerError> {
        self.inner.get(id).await
    }

    async fn remove(&self, id: RecordId) -> Result<(), LedgerError> {
        self.inner.remove(id).await
    }
}
