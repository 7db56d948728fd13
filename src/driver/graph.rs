//! Graph database driver
//!
//! Artifacts list every node, then every relationship with its direction
//! and type. Store-assigned ids are kept in the artifact so relationships can
//! be rewired on restore, but they do not contribute to the fingerprint: a
//! relationship is fingerprinted through the content of its endpoints, so a
//! restored graph with fresh ids fingerprints identically.

use super::{
    canonical_bytes, decode_entries, encode_entries, fingerprint_entries, paged, ArtifactStream, ArtifactSummary,
    DriverError, DriverOptions, EntryFingerprinter, EntryStream, RestoreSummary, StoreDriver,
};
use crate::integrity::{entity_digest, Fingerprint, FingerprintBuilder};
use crate::types::StoreKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// A node with its store-assigned id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    /// Store-assigned id; not preserved across restore
    pub id: i64,
    /// Labels in store order
    pub labels: Vec<String>,
    /// Property map
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// A typed, directed relationship
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphRelationship {
    /// Store-assigned id; not preserved across restore
    pub id: i64,
    /// Id of the start node
    pub start: i64,
    /// Id of the end node
    pub end: i64,
    /// Relationship type
    pub rel_type: String,
    /// Property map
    #[serde(default)]
    pub properties: BTreeMap<String, Value>,
}

/// Entity totals, compared before and after a capture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GraphCounts {
    /// Node count
    pub nodes: u64,
    /// Relationship count
    pub relationships: u64,
}

/// A whole graph, as handed to [`GraphClient::replace_graph`]
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphDump {
    /// Every node
    pub nodes: Vec<GraphNode>,
    /// Every relationship; endpoints refer to node ids in `nodes`
    pub relationships: Vec<GraphRelationship>,
}

/// One line of a graph artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GraphEntry {
    /// A node
    Node(GraphNode),
    /// A relationship between two earlier nodes
    Relationship(GraphRelationship),
}

/// Narrow view of a graph database used by [`GraphDriver`]
#[async_trait]
pub trait GraphClient: Send + Sync {
    /// Current node and relationship totals
    async fn counts(&self) -> Result<GraphCounts, DriverError>;

    /// Nodes ordered by id
    async fn nodes(&self, skip: u64, limit: usize) -> Result<Vec<GraphNode>, DriverError>;

    /// Relationships ordered by id
    async fn relationships(&self, skip: u64, limit: usize) -> Result<Vec<GraphRelationship>, DriverError>;

    /// Delete everything and load `dump` in a single transaction. The store
    /// may assign new ids; relationships refer to the dump's node ids.
    async fn replace_graph(&self, dump: &GraphDump) -> Result<(), DriverError>;
}

#[derive(Serialize)]
struct NodeContent<'a> {
    labels: Vec<&'a str>,
    properties: &'a BTreeMap<String, Value>,
}

#[derive(Serialize)]
struct RelationshipContent<'a> {
    rel_type: &'a str,
    properties: &'a BTreeMap<String, Value>,
}

/// Id-independent fingerprint; nodes must precede the relationships that use them
#[derive(Default)]
pub struct GraphFingerprinter {
    builder: FingerprintBuilder,
    node_digests: HashMap<i64, [u8; 32]>,
}

impl GraphFingerprinter {
    fn endpoint(&self, rel: &GraphRelationship, node: i64) -> Result<&[u8; 32], DriverError> {
        self.node_digests.get(&node).ok_or_else(|| {
            DriverError::Inconsistent(format!(
                "relationship {} references node {} outside the snapshot",
                rel.id, node
            ))
        })
    }
}

impl EntryFingerprinter<GraphEntry> for GraphFingerprinter {
    fn add(&mut self, entry: &GraphEntry) -> Result<(), DriverError> {
        match entry {
            GraphEntry::Node(node) => {
                let mut labels: Vec<&str> = node.labels.iter().map(String::as_str).collect();
                labels.sort_unstable();
                let digest = entity_digest(&canonical_bytes(&NodeContent {
                    labels,
                    properties: &node.properties,
                })?);
                if self.node_digests.insert(node.id, digest).is_some() {
                    return Err(DriverError::Inconsistent(format!("node {} appears twice", node.id)));
                }
                self.builder.add_digest(&digest);
            }
            GraphEntry::Relationship(rel) => {
                let mut canonical = canonical_bytes(&RelationshipContent {
                    rel_type: &rel.rel_type,
                    properties: &rel.properties,
                })?;
                canonical.extend_from_slice(self.endpoint(rel, rel.start)?);
                canonical.extend_from_slice(self.endpoint(rel, rel.end)?);
                self.builder.add(&canonical);
            }
        }
        Ok(())
    }

    fn finish(&self) -> Fingerprint {
        self.builder.finish()
    }
}

/// Driver for graph databases
pub struct GraphDriver {
    client: Arc<dyn GraphClient>,
    options: DriverOptions,
}

impl GraphDriver {
    /// Driver over `client`
    pub fn new(client: Arc<dyn GraphClient>, options: DriverOptions) -> Self {
        Self { client, options }
    }

    /// Nodes then relationships, bracketed by count checks that detect
    /// writes landing while the capture pages through the store
    fn entries(&self) -> EntryStream<GraphEntry> {
        let client = Arc::clone(&self.client);
        let page_size = self.options.page_size;

        stream::once(async move {
            let before = client.counts().await?;
            debug!(nodes = before.nodes, relationships = before.relationships, "Capturing graph");
            Ok::<_, DriverError>(capture_pages(client, page_size, before))
        })
        .try_flatten()
        .boxed()
    }

    fn decode(&self, artifact: &[u8], on_entry: impl FnMut(GraphEntry) -> Result<(), DriverError>) -> Result<ArtifactSummary, DriverError> {
        decode_entries(artifact, StoreKind::Graph, GraphFingerprinter::default(), on_entry)
    }
}

fn capture_pages(client: Arc<dyn GraphClient>, page_size: usize, before: GraphCounts) -> EntryStream<GraphEntry> {
    let nodes_seen = Arc::new(AtomicU64::new(0));
    let rels_seen = Arc::new(AtomicU64::new(0));

    let node_client = Arc::clone(&client);
    let node_counter = Arc::clone(&nodes_seen);
    let nodes = paged(page_size, move |skip, limit| {
        let client = Arc::clone(&node_client);
        async move { client.nodes(skip, limit).await }
    })
    .map_ok(move |node| {
        node_counter.fetch_add(1, Ordering::Relaxed);
        GraphEntry::Node(node)
    });

    let rel_client = Arc::clone(&client);
    let rel_counter = Arc::clone(&rels_seen);
    let relationships = paged(page_size, move |skip, limit| {
        let client = Arc::clone(&rel_client);
        async move { client.relationships(skip, limit).await }
    })
    .map_ok(move |rel| {
        rel_counter.fetch_add(1, Ordering::Relaxed);
        GraphEntry::Relationship(rel)
    });

    let verify = stream::once(async move {
        let after = client.counts().await?;
        let captured = GraphCounts {
            nodes: nodes_seen.load(Ordering::Relaxed),
            relationships: rels_seen.load(Ordering::Relaxed),
        };
        if after != before || captured != before {
            return Err(DriverError::Inconsistent(format!(
                "graph changed during capture: {:?} at start, {:?} captured, {:?} now",
                before, captured, after
            )));
        }
        Ok::<Option<GraphEntry>, DriverError>(None)
    })
    .try_filter_map(|entry| futures::future::ready(Ok(entry)));

    nodes.chain(relationships).chain(verify).boxed()
}

#[async_trait]
impl StoreDriver for GraphDriver {
    fn kind(&self) -> StoreKind {
        StoreKind::Graph
    }

    fn artifact_extension(&self) -> &'static str {
        self.options.compression.extension()
    }

    fn capture(&self) -> ArtifactStream {
        encode_entries(
            StoreKind::Graph,
            self.options.compression,
            self.entries(),
            GraphFingerprinter::default(),
        )
    }

    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        let mut dump = GraphDump::default();
        let summary = self.decode(&artifact, |entry| {
            match entry {
                GraphEntry::Node(node) => dump.nodes.push(node),
                GraphEntry::Relationship(rel) => dump.relationships.push(rel),
            }
            Ok(())
        })?;

        self.client.replace_graph(&dump).await?;
        info!(
            nodes = dump.nodes.len(),
            relationships = dump.relationships.len(),
            "Restored graph"
        );

        Ok(RestoreSummary {
            store_kind: StoreKind::Graph,
            entries: summary.entries,
            fingerprint: summary.fingerprint,
        })
    }

    async fn fingerprint(&self) -> Result<Fingerprint, DriverError> {
        fingerprint_entries(self.entries(), GraphFingerprinter::default()).await
    }

    async fn inspect(&self, artifact: &Bytes) -> Result<ArtifactSummary, DriverError> {
        self.decode(artifact, |_| Ok(()))
    }
}
