//! Store drivers: capture a live store into an artifact and restore it back
//!
//! One [`StoreDriver`] per [`StoreKind`]. Drivers never touch the ledger or
//! the artifact store; the orchestrators own both. Each driver talks to its
//! backend through a narrow client trait, with HTTP/SQL clients for
//! production and in-memory clients for tests.

pub mod graph;
/// In-memory store clients with fault injection
pub mod memory;
pub mod neo4j;
pub mod postgres;
pub mod qdrant;
pub mod relational;
pub mod vector;

pub use graph::{GraphClient, GraphDriver, GraphNode, GraphRelationship};
pub use memory::{FaultPlan, MemoryGraph, MemoryRelational, MemoryVectorIndex};
pub use neo4j::{Neo4jClient, Neo4jConfig};
pub use postgres::{PostgresSource, PostgresSourceConfig};
pub use qdrant::{QdrantClient, QdrantConfig};
pub use relational::{RelationalClient, RelationalDriver, RelationalSnapshot, TableSchema};
pub use vector::{CollectionConfig, Distance, VectorDriver, VectorIndexClient, VectorPoint};

use crate::artifact::format::{ArtifactHeader, ArtifactReader, ArtifactWriter, Compression};
use crate::integrity::{Fingerprint, FingerprintBuilder};
use crate::types::StoreKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Encoded artifact bytes produced by [`StoreDriver::capture`]
pub type ArtifactStream = BoxStream<'static, Result<Bytes, DriverError>>;

/// Lazily fetched entities of one store
pub type EntryStream<E> = BoxStream<'static, Result<E, DriverError>>;

/// Driver and store client errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// The store could not be reached or dropped the connection
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// The store changed underneath a capture or returned contradictory data
    #[error("Inconsistent snapshot: {0}")]
    Inconsistent(String),

    /// The artifact does not match the format or schema this driver reads
    #[error("Malformed artifact: {0}")]
    Malformed(String),

    /// The target store refused a write
    #[error("Write rejected: {0}")]
    Rejected(String),

    /// The store holds something this driver cannot represent
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Artifact encoding failure
    #[error("Encoding error: {0}")]
    Encoding(String),
}

/// Settings shared by every driver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// Entities fetched per page during capture
    pub page_size: usize,
    /// Entities written per batch during restore
    pub write_batch: usize,
    /// Artifact compression
    pub compression: Compression,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            page_size: 256,
            write_batch: 512,
            compression: Compression::default(),
        }
    }
}

/// What a restore wrote
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreSummary {
    /// Store kind restored
    pub store_kind: StoreKind,
    /// Entries written
    pub entries: u64,
    /// Fingerprint recorded in the artifact; the live store should match it
    pub fingerprint: Fingerprint,
}

/// Result of decoding and checking an artifact without writing it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactSummary {
    /// Artifact header
    pub header: ArtifactHeader,
    /// Entries between header and trailer
    pub entries: u64,
    /// Fingerprint recomputed from the entries
    pub fingerprint: Fingerprint,
}

/// Capture and restore for one store kind
#[async_trait]
pub trait StoreDriver: Send + Sync {
    /// Store kind this driver handles
    fn kind(&self) -> StoreKind;

    /// File extension of the artifacts this driver writes
    fn artifact_extension(&self) -> &'static str;

    /// Start a capture. Nothing runs until the stream is polled, and
    /// dropping the stream cancels the capture.
    fn capture(&self) -> ArtifactStream;

    /// Replace the target store's content with the artifact's
    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError>;

    /// Fingerprint of the live store
    async fn fingerprint(&self) -> Result<Fingerprint, DriverError>;

    /// Fully decode and check an artifact without writing anything
    async fn inspect(&self, artifact: &Bytes) -> Result<ArtifactSummary, DriverError>;
}

/// Drivers keyed by store kind
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<StoreKind, Arc<dyn StoreDriver>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a driver under its own kind, replacing any previous one
    pub fn register(&mut self, driver: Arc<dyn StoreDriver>) -> &mut Self {
        self.drivers.insert(driver.kind(), driver);
        self
    }

    /// Register `driver` and return the registry
    pub fn with(mut self, driver: Arc<dyn StoreDriver>) -> Self {
        self.register(driver);
        self
    }

    /// Driver for `kind`
    pub fn get(&self, kind: StoreKind) -> Option<Arc<dyn StoreDriver>> {
        self.drivers.get(&kind).cloned()
    }

    /// Registered kinds in stable order
    pub fn kinds(&self) -> Vec<StoreKind> {
        let mut kinds: Vec<_> = self.drivers.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

/// Folds entities into a [`Fingerprint`]
pub trait EntryFingerprinter<E>: Send {
    /// Fold one entry into the fingerprint
    fn add(&mut self, entry: &E) -> Result<(), DriverError>;
    /// Fingerprint of the entries folded so far
    fn finish(&self) -> Fingerprint;
}

/// Fingerprints each entity by its canonical JSON encoding
#[derive(Debug, Default)]
pub struct ContentFingerprinter {
    builder: FingerprintBuilder,
}

impl<E: Serialize> EntryFingerprinter<E> for ContentFingerprinter {
    fn add(&mut self, entry: &E) -> Result<(), DriverError> {
        let canonical = canonical_bytes(entry)?;
        self.builder.add(&canonical);
        Ok(())
    }

    fn finish(&self) -> Fingerprint {
        self.builder.finish()
    }
}

/// Deterministic JSON encoding (maps are ordered, no whitespace)
pub(crate) fn canonical_bytes<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, DriverError> {
    serde_json::to_vec(value).map_err(|e| DriverError::Encoding(format!("Failed to encode entity: {}", e)))
}

/// Lazily page through a store with offset/limit reads.
/// Stops after the first short page.
pub(crate) fn paged<T, F, Fut>(page_size: usize, mut fetch: F) -> EntryStream<T>
where
    T: Send + 'static,
    F: FnMut(u64, usize) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Vec<T>, DriverError>> + Send + 'static,
{
    let limit = page_size.max(1);
    stream::try_unfold((0u64, false), move |(offset, done)| {
        let next = if done { None } else { Some(fetch(offset, limit)) };
        async move {
            let Some(page) = next else {
                return Ok(None);
            };
            let page = page.await?;
            let fetched = page.len();
            Ok::<_, DriverError>(Some((page, (offset + fetched as u64, fetched < limit))))
        }
    })
    .map_ok(|page: Vec<T>| stream::iter(page.into_iter().map(Ok::<T, DriverError>)))
    .try_flatten()
    .boxed()
}

struct EncodeState<E, F> {
    entries: EntryStream<E>,
    writer: Option<ArtifactWriter>,
    fingerprinter: F,
}

/// Encode an entity stream into artifact chunks while fingerprinting it
pub(crate) fn encode_entries<E, F>(
    kind: StoreKind,
    compression: Compression,
    entries: EntryStream<E>,
    fingerprinter: F,
) -> ArtifactStream
where
    E: Serialize + Send + 'static,
    F: EntryFingerprinter<E> + 'static,
{
    let state = EncodeState {
        entries,
        writer: None,
        fingerprinter,
    };

    stream::try_unfold(Some(state), move |state| encode_step(state, kind, compression)).boxed()
}

async fn encode_step<E, F>(
    state: Option<EncodeState<E, F>>,
    kind: StoreKind,
    compression: Compression,
) -> Result<Option<(Bytes, Option<EncodeState<E, F>>)>, DriverError>
where
    E: Serialize + Send + 'static,
    F: EntryFingerprinter<E> + 'static,
{
    let Some(mut state) = state else {
        return Ok(None);
    };

    let mut writer = match state.writer.take() {
        Some(writer) => writer,
        None => ArtifactWriter::new(kind, compression)?,
    };

    while let Some(entry) = state.entries.try_next().await? {
        state.fingerprinter.add(&entry)?;
        writer.write_entry(&entry)?;
        if let Some(chunk) = writer.take_chunk() {
            state.writer = Some(writer);
            return Ok(Some((chunk, Some(state))));
        }
    }

    let rest = writer.finish(state.fingerprinter.finish())?;
    Ok(Some((rest, None)))
}

/// Fingerprint a live store by walking the same entities a capture would
pub(crate) async fn fingerprint_entries<E, F>(mut entries: EntryStream<E>, mut fingerprinter: F) -> Result<Fingerprint, DriverError>
where
    F: EntryFingerprinter<E>,
{
    while let Some(entry) = entries.try_next().await? {
        fingerprinter.add(&entry)?;
    }
    Ok(fingerprinter.finish())
}

/// Decode an artifact, recomputing its fingerprint and handing each entity
/// to `on_entry`. Any disagreement with the trailer is `Malformed`.
pub(crate) fn decode_entries<E, F>(
    artifact: &[u8],
    kind: StoreKind,
    mut fingerprinter: F,
    mut on_entry: impl FnMut(E) -> Result<(), DriverError>,
) -> Result<ArtifactSummary, DriverError>
where
    E: DeserializeOwned,
    F: EntryFingerprinter<E>,
{
    let mut reader = ArtifactReader::open(artifact, kind)?;
    let header = reader.header().clone();

    while let Some(entry) = reader.next_entry::<E>()? {
        fingerprinter
            .add(&entry)
            .map_err(|e| DriverError::Malformed(e.to_string()))?;
        on_entry(entry)?;
    }

    let trailer = reader.finish()?;
    let fingerprint = fingerprinter.finish();
    if fingerprint != trailer.fingerprint {
        return Err(DriverError::Malformed(format!(
            "content fingerprint {} does not match trailer {}",
            fingerprint, trailer.fingerprint
        )));
    }

    Ok(ArtifactSummary {
        header,
        entries: trailer.entries,
        fingerprint,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_paged_stops_on_short_page() {
        let calls = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let seen = Arc::clone(&calls);
        let items: Vec<u32> = (0..7).collect();

        let stream = paged(3, move |offset, limit| {
            seen.lock().push(offset);
            let page: Vec<u32> = items.iter().copied().skip(offset as usize).take(limit).collect();
            async move { Ok::<_, DriverError>(page) }
        });

        let collected: Vec<u32> = stream.try_collect().await.unwrap();
        assert_eq!(collected, (0..7).collect::<Vec<_>>());
        assert_eq!(*calls.lock(), vec![0, 3, 6]);
    }

    #[tokio::test]
    async fn test_encode_then_decode_checks_fingerprint() {
        let values = vec![json!({"k": 1}), json!({"k": 2}), json!({"k": 3})];
        let entries: EntryStream<Value> = stream::iter(values.clone().into_iter().map(Ok)).boxed();

        let chunks: Vec<Bytes> = encode_entries(StoreKind::Vector, Compression::default(), entries, ContentFingerprinter::default())
            .try_collect()
            .await
            .unwrap();
        let artifact: Vec<u8> = chunks.concat();

        let mut decoded = Vec::new();
        let summary = decode_entries::<Value, _>(&artifact, StoreKind::Vector, ContentFingerprinter::default(), |entry| {
            decoded.push(entry);
            Ok(())
        })
        .unwrap();

        assert_eq!(decoded, values);
        assert_eq!(summary.entries, 3);
        assert_eq!(summary.fingerprint.entities, 3);
    }

    #[tokio::test]
    async fn test_decode_rejects_fingerprint_mismatch() {
        let entries: EntryStream<Value> = stream::iter(vec![Ok(json!("a"))]).boxed();
        let chunks: Vec<Bytes> = encode_entries(StoreKind::Graph, Compression::None, entries, ContentFingerprinter::default())
            .try_collect()
            .await
            .unwrap();
        let text = String::from_utf8(chunks.concat()).unwrap().replace(r#"{"entry":"a"}"#, r#"{"entry":"b"}"#);

        let result = decode_entries::<Value, _>(text.as_bytes(), StoreKind::Graph, ContentFingerprinter::default(), |_| Ok(()));
        assert!(matches!(result, Err(DriverError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_capture_error_surfaces_in_stream() {
        let entries: EntryStream<Value> = stream::iter(vec![
            Ok(json!(1)),
            Err(DriverError::Unavailable("connection reset".to_string())),
        ])
        .boxed();

        let result: Result<Vec<Bytes>, _> =
            encode_entries(StoreKind::Vector, Compression::None, entries, ContentFingerprinter::default())
                .try_collect()
                .await;
        assert!(matches!(result, Err(DriverError::Unavailable(_))));
    }
}
