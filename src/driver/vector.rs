//! Vector index driver
//!
//! An artifact holds, per collection, the collection configuration (vector
//! size, distance metric and index options) followed by every point with its
//! vector and payload. Losing the distance metric would silently change
//! similarity results after a restore, so it is part of the artifact and of
//! the fingerprint.

use super::{
    decode_entries, encode_entries, fingerprint_entries, ArtifactStream, ArtifactSummary, ContentFingerprinter,
    DriverError, DriverOptions, EntryStream, RestoreSummary, StoreDriver,
};
use crate::integrity::Fingerprint;
use crate::types::StoreKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

/// Similarity metric of a vector space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Distance {
    /// Cosine similarity
    Cosine,
    /// Euclidean distance
    Euclid,
    /// Dot product
    Dot,
    /// Manhattan distance
    Manhattan,
}

/// Parameters of one vector space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorParams {
    /// Dimensions
    pub size: u64,
    /// Similarity metric
    pub distance: Distance,
    /// Index-specific options (on_disk, hnsw_config, quantization, ...)
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl VectorParams {
    /// Parameters without index-specific options
    pub fn new(size: u64, distance: Distance) -> Self {
        Self {
            size,
            distance,
            extra: BTreeMap::new(),
        }
    }
}

/// One unnamed vector space, or several named ones
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VectorsConfig {
    /// A single unnamed vector
    Single(VectorParams),
    /// Named vectors
    Named(BTreeMap<String, VectorParams>),
}

/// Everything needed to recreate a collection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Collection name
    pub name: String,
    /// Vector spaces
    pub vectors: VectorsConfig,
    /// Collection-level options passed back verbatim on create
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub options: BTreeMap<String, Value>,
}

impl CollectionConfig {
    /// Collection with one unnamed vector space
    pub fn new(name: impl Into<String>, vectors: VectorParams) -> Self {
        Self {
            name: name.into(),
            vectors: VectorsConfig::Single(vectors),
            options: BTreeMap::new(),
        }
    }
}

/// Point identifier: an unsigned integer or a UUID string
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PointId {
    /// Numeric id
    Num(u64),
    /// UUID id
    Uuid(String),
}

impl fmt::Display for PointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PointId::Num(n) => write!(f, "{}", n),
            PointId::Uuid(u) => f.write_str(u),
        }
    }
}

/// A point with its vector and payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorPoint {
    /// Point id
    pub id: PointId,
    /// A dense vector, or an object of named vectors
    pub vector: Value,
    /// Arbitrary JSON payload
    #[serde(default)]
    pub payload: BTreeMap<String, Value>,
}

/// A collection's configuration and size
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionInfo {
    /// Configuration
    pub config: CollectionConfig,
    /// Number of points
    pub points_count: u64,
}

/// One page of a scroll
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScrollPage {
    /// Points in id order
    pub points: Vec<VectorPoint>,
    /// Where the next page starts; `None` after the last page
    pub next_offset: Option<PointId>,
}

/// One line of a vector artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VectorEntry {
    /// A collection to recreate
    Collection(CollectionConfig),
    /// A point of an earlier collection
    Point {
        /// Owning collection
        collection: String,
        /// The point
        point: VectorPoint,
    },
}

/// Narrow view of a vector index used by [`VectorDriver`]
#[async_trait]
pub trait VectorIndexClient: Send + Sync {
    /// Names of every collection
    async fn collections(&self) -> Result<Vec<String>, DriverError>;

    /// `None` if the collection does not exist
    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, DriverError>;

    /// Up to `limit` points in id order, starting at `offset`
    async fn scroll(&self, name: &str, offset: Option<PointId>, limit: usize) -> Result<ScrollPage, DriverError>;

    /// Dropping a missing collection succeeds
    async fn drop_collection(&self, name: &str) -> Result<(), DriverError>;

    /// Create a collection from its configuration
    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), DriverError>;

    /// Insert or overwrite points
    async fn upsert(&self, name: &str, points: &[VectorPoint]) -> Result<(), DriverError>;
}

/// Driver for vector indexes
pub struct VectorDriver {
    client: Arc<dyn VectorIndexClient>,
    options: DriverOptions,
    /// Restrict to these collections; `None` covers the whole index
    collections: Option<Vec<String>>,
}

impl VectorDriver {
    /// Driver over every collection of `client`
    pub fn new(client: Arc<dyn VectorIndexClient>, options: DriverOptions) -> Self {
        Self {
            client,
            options,
            collections: None,
        }
    }

    /// Restrict capture and restore to `collections`
    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = Some(collections);
        self
    }

    fn entries(&self) -> EntryStream<VectorEntry> {
        let state = ScrollState {
            client: Arc::clone(&self.client),
            selected: self.collections.clone(),
            pending: None,
            current: None,
            page_size: self.options.page_size.max(1),
        };

        stream::try_unfold(state, scroll_step)
            .map_ok(|page: Vec<VectorEntry>| stream::iter(page.into_iter().map(Ok::<_, DriverError>)))
            .try_flatten()
            .boxed()
    }

    fn decode(&self, artifact: &[u8], mut on_entry: impl FnMut(VectorEntry) -> Result<(), DriverError>) -> Result<ArtifactSummary, DriverError> {
        let mut declared = BTreeSet::new();
        decode_entries(artifact, StoreKind::Vector, ContentFingerprinter::default(), |entry: VectorEntry| {
            match &entry {
                VectorEntry::Collection(config) => {
                    if !declared.insert(config.name.clone()) {
                        return Err(DriverError::Malformed(format!("collection {} declared twice", config.name)));
                    }
                }
                VectorEntry::Point { collection, point } => {
                    if !declared.contains(collection) {
                        return Err(DriverError::Malformed(format!(
                            "point {} precedes the configuration of collection {}",
                            point.id, collection
                        )));
                    }
                }
            }
            on_entry(entry)
        })
    }
}

struct ActiveCollection {
    name: String,
    expected: u64,
    seen: u64,
    offset: Option<PointId>,
    exhausted: bool,
}

struct ScrollState {
    client: Arc<dyn VectorIndexClient>,
    selected: Option<Vec<String>>,
    pending: Option<VecDeque<String>>,
    current: Option<ActiveCollection>,
    page_size: usize,
}

/// Produce the next batch of entries: a collection header, a page of points,
/// or nothing once every collection has been scrolled and re-counted.
async fn scroll_step(mut state: ScrollState) -> Result<Option<(Vec<VectorEntry>, ScrollState)>, DriverError> {
    if state.pending.is_none() {
        let mut names = match &state.selected {
            Some(names) => names.clone(),
            None => state.client.collections().await?,
        };
        names.sort();
        names.dedup();
        state.pending = Some(names.into());
    }

    loop {
        let Some(mut active) = state.current.take() else {
            let Some(name) = state.pending.as_mut().and_then(VecDeque::pop_front) else {
                return Ok(None);
            };
            let info = state
                .client
                .collection(&name)
                .await?
                .ok_or_else(|| DriverError::Inconsistent(format!("collection {} does not exist", name)))?;

            debug!(collection = %name, points = info.points_count, "Capturing vector collection");
            state.current = Some(ActiveCollection {
                name,
                expected: info.points_count,
                seen: 0,
                offset: None,
                exhausted: false,
            });
            return Ok(Some((vec![VectorEntry::Collection(info.config)], state)));
        };

        if active.exhausted {
            let now = state
                .client
                .collection(&active.name)
                .await?
                .map(|info| info.points_count)
                .ok_or_else(|| DriverError::Inconsistent(format!("collection {} vanished during capture", active.name)))?;

            if active.seen != active.expected || now != active.expected {
                return Err(DriverError::Inconsistent(format!(
                    "collection {} changed during capture: {} points at start, {} captured, {} now",
                    active.name, active.expected, active.seen, now
                )));
            }
            continue;
        }

        let page = state
            .client
            .scroll(&active.name, active.offset.take(), state.page_size)
            .await?;
        active.seen += page.points.len() as u64;
        active.exhausted = page.next_offset.is_none();
        active.offset = page.next_offset;

        let entries: Vec<VectorEntry> = page
            .points
            .into_iter()
            .map(|point| VectorEntry::Point {
                collection: active.name.clone(),
                point,
            })
            .collect();
        state.current = Some(active);

        if !entries.is_empty() {
            return Ok(Some((entries, state)));
        }
    }
}

#[async_trait]
impl StoreDriver for VectorDriver {
    fn kind(&self) -> StoreKind {
        StoreKind::Vector
    }

    fn artifact_extension(&self) -> &'static str {
        self.options.compression.extension()
    }

    fn capture(&self) -> ArtifactStream {
        encode_entries(
            StoreKind::Vector,
            self.options.compression,
            self.entries(),
            ContentFingerprinter::default(),
        )
    }

    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        let mut collections: Vec<(CollectionConfig, Vec<VectorPoint>)> = Vec::new();
        let summary = self.decode(&artifact, |entry| {
            match entry {
                VectorEntry::Collection(config) => collections.push((config, Vec::new())),
                VectorEntry::Point { collection, point } => {
                    // decode() guarantees the collection was declared
                    if let Some((_, points)) = collections.iter_mut().find(|(c, _)| c.name == collection) {
                        points.push(point);
                    }
                }
            }
            Ok(())
        })?;

        // A whole-index driver leaves nothing behind that the artifact does not hold
        if self.collections.is_none() {
            let keep: BTreeSet<&str> = collections.iter().map(|(c, _)| c.name.as_str()).collect();
            for existing in self.client.collections().await? {
                if !keep.contains(existing.as_str()) {
                    info!(collection = %existing, "Dropping collection absent from artifact");
                    self.client.drop_collection(&existing).await?;
                }
            }
        }

        let batch = self.options.write_batch.max(1);
        for (config, points) in &collections {
            self.client.drop_collection(&config.name).await?;
            self.client.create_collection(config).await?;
            for chunk in points.chunks(batch) {
                self.client.upsert(&config.name, chunk).await?;
            }
            info!(collection = %config.name, points = points.len(), "Restored vector collection");
        }

        Ok(RestoreSummary {
            store_kind: StoreKind::Vector,
            entries: summary.entries,
            fingerprint: summary.fingerprint,
        })
    }

    async fn fingerprint(&self) -> Result<Fingerprint, DriverError> {
        fingerprint_entries(self.entries(), ContentFingerprinter::default()).await
    }

    async fn inspect(&self, artifact: &Bytes) -> Result<ArtifactSummary, DriverError> {
        self.decode(artifact, |_| Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::memory::{FaultPlan, MemoryVectorIndex};
    use serde_json::json;

    async fn seeded() -> MemoryVectorIndex {
        let index = MemoryVectorIndex::new();
        let config = CollectionConfig::new("docs", VectorParams::new(3, Distance::Dot));
        index.create_collection(&config).await.unwrap();
        let points: Vec<VectorPoint> = (0..10)
            .map(|i| VectorPoint {
                id: PointId::Num(i),
                vector: json!([i as f64 * 0.5, 1.0, -0.25]),
                payload: BTreeMap::from([("title".to_string(), json!(format!("doc {}", i)))]),
            })
            .collect();
        index.upsert("docs", &points).await.unwrap();
        index
    }

    fn driver(index: &MemoryVectorIndex) -> VectorDriver {
        let options = DriverOptions {
            page_size: 3,
            ..DriverOptions::default()
        };
        VectorDriver::new(Arc::new(index.clone()), options)
    }

    async fn capture(driver: &VectorDriver) -> Result<Bytes, DriverError> {
        let chunks: Vec<Bytes> = driver.capture().try_collect().await?;
        Ok(Bytes::from(chunks.concat()))
    }

    #[tokio::test]
    async fn test_restore_preserves_distance_and_points() {
        let source = seeded().await;
        let artifact = capture(&driver(&source)).await.unwrap();

        let target = MemoryVectorIndex::new();
        let stale = CollectionConfig::new("stale", VectorParams::new(2, Distance::Cosine));
        target.create_collection(&stale).await.unwrap();

        let summary = driver(&target).restore(artifact).await.unwrap();
        assert_eq!(summary.entries, 11);

        let restored = target.collection("docs").await.unwrap().unwrap();
        assert_eq!(restored.points_count, 10);
        match restored.config.vectors {
            VectorsConfig::Single(params) => assert_eq!(params.distance, Distance::Dot),
            other => panic!("unexpected vectors config {:?}", other),
        }
        assert!(target.collection("stale").await.unwrap().is_none());
        assert_eq!(
            driver(&target).fingerprint().await.unwrap(),
            driver(&source).fingerprint().await.unwrap()
        );
    }

    #[tokio::test]
    async fn test_disconnect_mid_capture_fails() {
        let index = seeded().await;
        index.set_faults(FaultPlan::disconnect_after(2));

        let err = capture(&driver(&index)).await.unwrap_err();
        assert!(matches!(err, DriverError::Unavailable(_)));
    }

    #[tokio::test]
    async fn test_concurrent_write_is_inconsistent() {
        let index = seeded().await;
        index.set_faults(FaultPlan::concurrent_write_after(1));

        let err = capture(&driver(&index)).await.unwrap_err();
        assert!(matches!(err, DriverError::Inconsistent(_)));
    }

    #[test]
    fn test_named_vectors_round_trip_through_json() {
        let text = r#"{"name":"multi","vectors":{"image":{"size":4,"distance":"Euclid"},"text":{"size":8,"distance":"Cosine","on_disk":true}}}"#;
        let config: CollectionConfig = serde_json::from_str(text).unwrap();
        match &config.vectors {
            VectorsConfig::Named(spaces) => {
                assert_eq!(spaces["text"].extra.get("on_disk"), Some(&json!(true)));
                assert_eq!(spaces["image"].distance, Distance::Euclid);
            }
            other => panic!("expected named vectors, got {:?}", other),
        }
    }
}
