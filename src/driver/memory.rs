// In-memory store clients with fault injection for tests and dry runs

use super::graph::{GraphClient, GraphCounts, GraphDump, GraphNode, GraphRelationship};
use super::relational::{RelationalClient, RelationalDump, RelationalSnapshot, Row, TableSchema};
use super::vector::{CollectionConfig, CollectionInfo, PointId, ScrollPage, VectorIndexClient, VectorPoint};
use super::DriverError;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Failures to inject into an in-memory store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FaultPlan {
    /// Drop the connection once this many pages have been served
    pub disconnect_after_pages: Option<usize>,
    /// Write a new entity into the live store right after this many pages
    pub concurrent_write_after_pages: Option<usize>,
    /// Refuse every write
    pub reject_writes: bool,
}

impl FaultPlan {
    /// No faults
    pub fn none() -> Self {
        Self::default()
    }

    /// Fail every page read after `pages` pages
    pub fn disconnect_after(pages: usize) -> Self {
        Self {
            disconnect_after_pages: Some(pages),
            ..Self::default()
        }
    }

    /// Write a new entity into the live store after `pages` pages
    pub fn concurrent_write_after(pages: usize) -> Self {
        Self {
            concurrent_write_after_pages: Some(pages),
            ..Self::default()
        }
    }

    /// Refuse every write
    pub fn reject_writes() -> Self {
        Self {
            reject_writes: true,
            ..Self::default()
        }
    }
}

#[derive(Default)]
struct Faults {
    plan: Mutex<FaultPlan>,
    pages_served: AtomicUsize,
}

impl Faults {
    fn set(&self, plan: FaultPlan) {
        *self.plan.lock() = plan;
        self.pages_served.store(0, Ordering::SeqCst);
    }

    fn before_page(&self) -> Result<(), DriverError> {
        let served = self.pages_served.load(Ordering::SeqCst);
        match self.plan.lock().disconnect_after_pages {
            Some(limit) if served >= limit => Err(DriverError::Unavailable(format!(
                "connection reset after {} pages",
                served
            ))),
            _ => Ok(()),
        }
    }

    /// Count a served page; true when a concurrent write should land now
    fn after_page(&self) -> bool {
        let served = self.pages_served.fetch_add(1, Ordering::SeqCst) + 1;
        let mut plan = self.plan.lock();
        if plan.concurrent_write_after_pages == Some(served) {
            plan.concurrent_write_after_pages = None;
            true
        } else {
            false
        }
    }

    fn check_write(&self) -> Result<(), DriverError> {
        if self.plan.lock().reject_writes {
            Err(DriverError::Rejected("store is refusing writes".to_string()))
        } else {
            Ok(())
        }
    }
}

struct MemoryCollection {
    config: CollectionConfig,
    points: BTreeMap<PointId, VectorPoint>,
}

/// In-memory vector index
#[derive(Clone, Default)]
pub struct MemoryVectorIndex {
    collections: Arc<dashmap::DashMap<String, MemoryCollection>>,
    faults: Arc<Faults>,
}

impl MemoryVectorIndex {
    /// Empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the fault plan
    pub fn set_faults(&self, plan: FaultPlan) {
        self.faults.set(plan);
    }

    fn inject_point(&self, name: &str) {
        if let Some(mut collection) = self.collections.get_mut(name) {
            let id = PointId::Uuid(Uuid::new_v4().to_string());
            collection.points.insert(
                id.clone(),
                VectorPoint {
                    id,
                    vector: json!([]),
                    payload: BTreeMap::new(),
                },
            );
        }
    }
}

#[async_trait]
impl VectorIndexClient for MemoryVectorIndex {
    async fn collections(&self) -> Result<Vec<String>, DriverError> {
        let mut names: Vec<String> = self.collections.iter().map(|c| c.key().clone()).collect();
        names.sort();
        Ok(names)
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, DriverError> {
        Ok(self.collections.get(name).map(|c| CollectionInfo {
            config: c.config.clone(),
            points_count: c.points.len() as u64,
        }))
    }

    async fn scroll(&self, name: &str, offset: Option<PointId>, limit: usize) -> Result<ScrollPage, DriverError> {
        self.faults.before_page()?;

        let page = {
            let collection = self
                .collections
                .get(name)
                .ok_or_else(|| DriverError::Inconsistent(format!("collection {} not found", name)))?;

            let mut remaining: Box<dyn Iterator<Item = &VectorPoint>> = match &offset {
                Some(start) => Box::new(collection.points.range(start.clone()..).map(|(_, p)| p)),
                None => Box::new(collection.points.values()),
            };
            let points: Vec<VectorPoint> = remaining.by_ref().take(limit).cloned().collect();
            let next_offset = remaining.next().map(|p| p.id.clone());
            ScrollPage { points, next_offset }
        };

        if self.faults.after_page() {
            self.inject_point(name);
        }
        Ok(page)
    }

    async fn drop_collection(&self, name: &str) -> Result<(), DriverError> {
        self.faults.check_write()?;
        self.collections.remove(name);
        Ok(())
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), DriverError> {
        self.faults.check_write()?;
        match self.collections.entry(config.name.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(DriverError::Rejected(format!(
                "collection {} already exists",
                config.name
            ))),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(MemoryCollection {
                    config: config.clone(),
                    points: BTreeMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn upsert(&self, name: &str, points: &[VectorPoint]) -> Result<(), DriverError> {
        self.faults.check_write()?;
        let mut collection = self
            .collections
            .get_mut(name)
            .ok_or_else(|| DriverError::Rejected(format!("collection {} not found", name)))?;
        for point in points {
            collection.points.insert(point.id.clone(), point.clone());
        }
        Ok(())
    }
}

#[derive(Default)]
struct GraphData {
    nodes: BTreeMap<i64, GraphNode>,
    relationships: BTreeMap<i64, GraphRelationship>,
    next_id: i64,
}

impl GraphData {
    fn allocate(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }
}

/// In-memory property graph; ids are never reused, even across restores
#[derive(Clone, Default)]
pub struct MemoryGraph {
    data: Arc<RwLock<GraphData>>,
    faults: Arc<Faults>,
}

impl MemoryGraph {
    /// Empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the fault plan
    pub fn set_faults(&self, plan: FaultPlan) {
        self.faults.set(plan);
    }

    /// Add a node and return its id
    pub fn add_node(&self, labels: &[&str], properties: BTreeMap<String, Value>) -> i64 {
        let mut data = self.data.write();
        let id = data.allocate();
        data.nodes.insert(
            id,
            GraphNode {
                id,
                labels: labels.iter().map(|l| l.to_string()).collect(),
                properties,
            },
        );
        id
    }

    /// Add a relationship between existing nodes and return its id
    pub fn add_relationship(&self, start: i64, end: i64, rel_type: &str, properties: BTreeMap<String, Value>) -> i64 {
        let mut data = self.data.write();
        let id = data.allocate();
        data.relationships.insert(
            id,
            GraphRelationship {
                id,
                start,
                end,
                rel_type: rel_type.to_string(),
                properties,
            },
        );
        id
    }

    fn page<T: Clone>(&self, items: impl Iterator<Item = T>, skip: u64, limit: usize) -> Vec<T> {
        items.skip(skip as usize).take(limit).collect()
    }

    fn finish_page(&self) {
        if self.faults.after_page() {
            self.add_node(&["Injected"], BTreeMap::new());
        }
    }
}

#[async_trait]
impl GraphClient for MemoryGraph {
    async fn counts(&self) -> Result<GraphCounts, DriverError> {
        let data = self.data.read();
        Ok(GraphCounts {
            nodes: data.nodes.len() as u64,
            relationships: data.relationships.len() as u64,
        })
    }

    async fn nodes(&self, skip: u64, limit: usize) -> Result<Vec<GraphNode>, DriverError> {
        self.faults.before_page()?;
        let page = {
            let data = self.data.read();
            self.page(data.nodes.values().cloned(), skip, limit)
        };
        self.finish_page();
        Ok(page)
    }

    async fn relationships(&self, skip: u64, limit: usize) -> Result<Vec<GraphRelationship>, DriverError> {
        self.faults.before_page()?;
        let page = {
            let data = self.data.read();
            self.page(data.relationships.values().cloned(), skip, limit)
        };
        self.finish_page();
        Ok(page)
    }

    async fn replace_graph(&self, dump: &GraphDump) -> Result<(), DriverError> {
        self.faults.check_write()?;

        let mut data = self.data.write();
        let mut next_id = data.next_id;
        let mut allocate = || {
            next_id += 1;
            next_id
        };

        let mut remap = HashMap::with_capacity(dump.nodes.len());
        let mut nodes = BTreeMap::new();
        for node in &dump.nodes {
            let id = allocate();
            remap.insert(node.id, id);
            nodes.insert(id, GraphNode { id, ..node.clone() });
        }

        let mut relationships = BTreeMap::new();
        for rel in &dump.relationships {
            let (start, end) = match (remap.get(&rel.start), remap.get(&rel.end)) {
                (Some(&start), Some(&end)) => (start, end),
                _ => {
                    return Err(DriverError::Rejected(format!(
                        "relationship {} has a missing endpoint",
                        rel.id
                    )))
                }
            };
            let id = allocate();
            relationships.insert(
                id,
                GraphRelationship {
                    id,
                    start,
                    end,
                    ..rel.clone()
                },
            );
        }

        // Swap in only once the whole dump is valid
        data.nodes = nodes;
        data.relationships = relationships;
        data.next_id = next_id;
        Ok(())
    }
}

#[derive(Clone, Default)]
struct RelationalData {
    tables: Vec<TableSchema>,
    rows: HashMap<String, Vec<Row>>,
}

impl RelationalData {
    fn schema(&self, table: &str) -> Option<&TableSchema> {
        self.tables.iter().find(|t| t.name == table)
    }

    fn check_references(&self, table: &str, row: &Row) -> Result<(), DriverError> {
        let schema = self
            .schema(table)
            .ok_or_else(|| DriverError::Rejected(format!("table {} does not exist", table)))?;

        for fk in &schema.foreign_keys {
            let values: Vec<&Value> = fk.columns.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
            if values.iter().any(|v| v.is_null()) {
                continue;
            }
            let parents = self.rows.get(&fk.references_table).map(Vec::as_slice).unwrap_or(&[]);
            let found = parents.iter().any(|parent| {
                fk.references_columns
                    .iter()
                    .zip(&values)
                    .all(|(column, value)| parent.get(column) == Some(*value))
            });
            if !found {
                return Err(DriverError::Rejected(format!(
                    "row in {} violates foreign key to {}",
                    table, fk.references_table
                )));
            }
        }
        Ok(())
    }
}

/// In-memory relational database with a fixed schema
#[derive(Clone)]
pub struct MemoryRelational {
    data: Arc<RwLock<RelationalData>>,
    faults: Arc<Faults>,
}

impl MemoryRelational {
    /// Empty database with a fixed schema
    pub fn new(tables: Vec<TableSchema>) -> Self {
        let rows = tables.iter().map(|t| (t.name.clone(), Vec::new())).collect();
        Self {
            data: Arc::new(RwLock::new(RelationalData { tables, rows })),
            faults: Arc::new(Faults::default()),
        }
    }

    /// Replace the fault plan
    pub fn set_faults(&self, plan: FaultPlan) {
        self.faults.set(plan);
    }

    /// Insert one row, enforcing foreign keys
    pub fn insert(&self, table: &str, row: Row) -> Result<(), DriverError> {
        let mut data = self.data.write();
        data.check_references(table, &row)?;
        data.rows.entry(table.to_string()).or_default().push(row);
        Ok(())
    }

    /// Set `column` on the row whose `key_column` equals `key`, enforcing
    /// foreign keys on the updated row
    pub fn update(&self, table: &str, key_column: &str, key: &Value, column: &str, value: Value) -> Result<(), DriverError> {
        let mut data = self.data.write();
        let position = data
            .rows
            .get(table)
            .and_then(|rows| rows.iter().position(|r| r.get(key_column) == Some(key)))
            .ok_or_else(|| DriverError::Rejected(format!("no row in {} with {} = {}", table, key_column, key)))?;

        let mut updated = data.rows[table][position].clone();
        updated.insert(column.to_string(), value);
        data.check_references(table, &updated)?;
        if let Some(rows) = data.rows.get_mut(table) {
            rows[position] = updated;
        }
        Ok(())
    }

    /// Rows currently in `table`
    pub fn row_count(&self, table: &str) -> usize {
        self.data.read().rows.get(table).map(Vec::len).unwrap_or(0)
    }

    /// Copy of the rows in `table`
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.data.read().rows.get(table).cloned().unwrap_or_default()
    }
}

/// Copy-on-open snapshot: later writes to the live store are invisible to it
struct MemorySnapshot {
    data: RelationalData,
    live: MemoryRelational,
}

#[async_trait]
impl RelationalSnapshot for MemorySnapshot {
    async fn tables(&self) -> Result<Vec<TableSchema>, DriverError> {
        Ok(self.data.tables.clone())
    }

    async fn rows(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>, DriverError> {
        self.live.faults.before_page()?;
        let page = self
            .data
            .rows
            .get(table)
            .map(|rows| rows.iter().skip(offset as usize).take(limit).cloned().collect())
            .unwrap_or_default();

        if self.live.faults.after_page() {
            let mut data = self.live.data.write();
            if let Some(rows) = data.rows.get_mut(table) {
                rows.push(Row::new());
            }
        }
        Ok(page)
    }

    async fn close(&self) -> Result<(), DriverError> {
        Ok(())
    }
}

#[async_trait]
impl RelationalClient for MemoryRelational {
    async fn open_snapshot(&self) -> Result<Arc<dyn RelationalSnapshot>, DriverError> {
        self.faults.before_page()?;
        Ok(Arc::new(MemorySnapshot {
            data: self.data.read().clone(),
            live: self.clone(),
        }))
    }

    async fn replace_all(&self, dump: &RelationalDump) -> Result<(), DriverError> {
        self.faults.check_write()?;

        let mut data = self.data.write();
        for table in &dump.tables {
            if data.schema(&table.name).is_none() {
                return Err(DriverError::Rejected(format!("table {} does not exist in target", table.name)));
            }
        }

        // Build the replacement beside the live rows: all or nothing
        let mut staged = RelationalData {
            tables: data.tables.clone(),
            rows: data.tables.iter().map(|t| (t.name.clone(), Vec::new())).collect(),
        };
        for table in &dump.tables {
            for row in dump.rows.get(&table.name).map(Vec::as_slice).unwrap_or(&[]) {
                staged.check_references(&table.name, row)?;
                staged.rows.entry(table.name.clone()).or_default().push(row.clone());
            }
        }

        *data = staged;
        Ok(())
    }
}
