//! Relational database driver
//!
//! Captures run inside one consistent read session. The artifact lists the
//! table schemas in foreign-key dependency order, then every row table by
//! table in that same order, so replaying it never inserts a child row
//! before its parent.

use super::{
    decode_entries, encode_entries, fingerprint_entries, paged, ArtifactStream, ArtifactSummary, ContentFingerprinter,
    DriverError, DriverOptions, EntryStream, RestoreSummary, StoreDriver,
};
use crate::integrity::Fingerprint;
use crate::types::StoreKind;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt, TryStreamExt};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// Column name to JSON value
pub type Row = BTreeMap<String, Value>;

/// One column of a table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    /// Column name
    pub name: String,
    /// Declared SQL type
    pub data_type: String,
    /// Accepts NULL
    pub nullable: bool,
}

/// A foreign key constraint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    /// Referencing columns
    pub columns: Vec<String>,
    /// Referenced table
    pub references_table: String,
    /// Referenced columns, in the same order
    pub references_columns: Vec<String>,
}

/// Shape of one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    /// Table name
    pub name: String,
    /// Columns in ordinal order
    pub columns: Vec<ColumnSchema>,
    /// Primary key columns
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Outgoing foreign keys
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    /// Table with no columns
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }

    /// Append a column
    pub fn column(mut self, name: &str, data_type: &str, nullable: bool) -> Self {
        self.columns.push(ColumnSchema {
            name: name.to_string(),
            data_type: data_type.to_string(),
            nullable,
        });
        self
    }

    /// Set the primary key
    pub fn primary_key(mut self, columns: &[&str]) -> Self {
        self.primary_key = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    /// Add a foreign key
    pub fn foreign_key(mut self, columns: &[&str], table: &str, references: &[&str]) -> Self {
        self.foreign_keys.push(ForeignKey {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            references_table: table.to_string(),
            references_columns: references.iter().map(|c| c.to_string()).collect(),
        });
        self
    }
}

/// Tables in dependency order with their rows
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RelationalDump {
    /// Tables in dependency order
    pub tables: Vec<TableSchema>,
    /// Rows per table
    pub rows: HashMap<String, Vec<Row>>,
}

/// One line of a relational artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelationalEntry {
    /// A table schema, before any of its rows
    Table(TableSchema),
    /// A row of an earlier table
    Row {
        /// Owning table
        table: String,
        /// Column values
        values: Row,
    },
}

/// A read session pinned to one point in time
#[async_trait]
pub trait RelationalSnapshot: Send + Sync {
    /// Table schemas in the namespace
    async fn tables(&self) -> Result<Vec<TableSchema>, DriverError>;

    /// Rows in a stable order
    async fn rows(&self, table: &str, offset: u64, limit: usize) -> Result<Vec<Row>, DriverError>;

    /// End the session; dropping without closing must also release it
    async fn close(&self) -> Result<(), DriverError>;
}

/// Narrow view of a relational database used by [`RelationalDriver`]
#[async_trait]
pub trait RelationalClient: Send + Sync {
    /// Open a consistent read session
    async fn open_snapshot(&self) -> Result<Arc<dyn RelationalSnapshot>, DriverError>;

    /// Empty every table of the namespace and load `dump`, atomically.
    /// Tables in the dump that the target lacks are rejected.
    async fn replace_all(&self, dump: &RelationalDump) -> Result<(), DriverError>;
}

/// Order tables so every referenced table precedes the tables referencing it.
/// Self references are left to [`parent_first`]; other cycles cannot be replayed in one pass.
pub fn dependency_order(mut tables: Vec<TableSchema>) -> Result<Vec<TableSchema>, DriverError> {
    tables.sort_by(|a, b| a.name.cmp(&b.name));

    let mut graph = DiGraph::<usize, ()>::new();
    let nodes: Vec<_> = (0..tables.len()).map(|i| graph.add_node(i)).collect();
    let index: HashMap<&str, usize> = tables.iter().enumerate().map(|(i, t)| (t.name.as_str(), i)).collect();

    for (child, table) in tables.iter().enumerate() {
        for fk in &table.foreign_keys {
            match index.get(fk.references_table.as_str()) {
                Some(&parent) if parent != child => {
                    graph.update_edge(nodes[parent], nodes[child], ());
                }
                Some(_) => {}
                None => debug!(table = %table.name, references = %fk.references_table, "Foreign key points outside the snapshot"),
            }
        }
    }

    let order = toposort(&graph, None).map_err(|cycle| {
        let table = &tables[graph[cycle.node_id()]].name;
        DriverError::Unsupported(format!("foreign-key cycle involving table {}", table))
    })?;

    let mut slots: Vec<Option<TableSchema>> = tables.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|node| slots[graph[node]].take()).collect())
}

/// Reorder the rows of a self-referencing table so each referenced row
/// precedes the rows pointing at it. Row-level cycles keep the captured order.
pub fn parent_first(table: &TableSchema, rows: Vec<Row>) -> Vec<Row> {
    let self_refs: Vec<&ForeignKey> = table
        .foreign_keys
        .iter()
        .filter(|fk| fk.references_table == table.name)
        .collect();
    if self_refs.is_empty() || rows.len() < 2 {
        return rows;
    }

    let tuple = |row: &Row, columns: &[String]| -> Option<String> {
        let values: Vec<&Value> = columns.iter().map(|c| row.get(c).unwrap_or(&Value::Null)).collect();
        if values.iter().any(|v| v.is_null()) {
            return None;
        }
        serde_json::to_string(&values).ok()
    };

    let mut graph = DiGraph::<usize, ()>::with_capacity(rows.len(), rows.len());
    let nodes: Vec<_> = (0..rows.len()).map(|i| graph.add_node(i)).collect();
    for fk in &self_refs {
        let owners: HashMap<String, usize> = rows
            .iter()
            .enumerate()
            .filter_map(|(i, row)| tuple(row, &fk.references_columns).map(|key| (key, i)))
            .collect();
        for (child, row) in rows.iter().enumerate() {
            if let Some(&parent) = tuple(row, &fk.columns).and_then(|key| owners.get(&key)) {
                if parent != child {
                    graph.update_edge(nodes[parent], nodes[child], ());
                }
            }
        }
    }

    match toposort(&graph, None) {
        Ok(order) => {
            let mut slots: Vec<Option<Row>> = rows.into_iter().map(Some).collect();
            order.into_iter().filter_map(|node| slots[graph[node]].take()).collect()
        }
        Err(_) => {
            debug!(table = %table.name, "Self-referencing rows form a cycle; keeping captured order");
            rows
        }
    }
}

/// Driver for relational databases
pub struct RelationalDriver {
    client: Arc<dyn RelationalClient>,
    options: DriverOptions,
}

impl RelationalDriver {
    /// Driver over `client`
    pub fn new(client: Arc<dyn RelationalClient>, options: DriverOptions) -> Self {
        Self { client, options }
    }

    fn entries(&self) -> EntryStream<RelationalEntry> {
        let client = Arc::clone(&self.client);
        let page_size = self.options.page_size;

        stream::once(async move {
            let snapshot = client.open_snapshot().await?;
            let tables = dependency_order(snapshot.tables().await?)?;
            debug!(tables = tables.len(), "Capturing relational snapshot");
            Ok::<_, DriverError>(snapshot_entries(snapshot, tables, page_size))
        })
        .try_flatten()
        .boxed()
    }

    fn decode(&self, artifact: &[u8], mut on_entry: impl FnMut(RelationalEntry) -> Result<(), DriverError>) -> Result<ArtifactSummary, DriverError> {
        let mut declared: HashSet<String> = HashSet::new();
        decode_entries(artifact, StoreKind::Relational, ContentFingerprinter::default(), |entry: RelationalEntry| {
            match &entry {
                RelationalEntry::Table(schema) => {
                    if !declared.insert(schema.name.clone()) {
                        return Err(DriverError::Malformed(format!("table {} declared twice", schema.name)));
                    }
                }
                RelationalEntry::Row { table, .. } => {
                    if !declared.contains(table) {
                        return Err(DriverError::Malformed(format!("row for undeclared table {}", table)));
                    }
                }
            }
            on_entry(entry)
        })
    }
}

fn snapshot_entries(
    snapshot: Arc<dyn RelationalSnapshot>,
    tables: Vec<TableSchema>,
    page_size: usize,
) -> EntryStream<RelationalEntry> {
    let names: Vec<String> = tables.iter().map(|t| t.name.clone()).collect();
    let schemas = stream::iter(tables.into_iter().map(|t| Ok::<_, DriverError>(RelationalEntry::Table(t))));

    let row_snapshot = Arc::clone(&snapshot);
    let rows = stream::iter(names).flat_map(move |table| {
        let snapshot = Arc::clone(&row_snapshot);
        let name = table.clone();
        paged(page_size, move |offset, limit| {
            let snapshot = Arc::clone(&snapshot);
            let table = table.clone();
            async move { snapshot.rows(&table, offset, limit).await }
        })
        .map_ok(move |values| RelationalEntry::Row {
            table: name.clone(),
            values,
        })
    });

    let close = stream::once(async move {
        snapshot.close().await?;
        Ok::<Option<RelationalEntry>, DriverError>(None)
    })
    .try_filter_map(|entry| futures::future::ready(Ok(entry)));

    schemas.chain(rows).chain(close).boxed()
}

#[async_trait]
impl StoreDriver for RelationalDriver {
    fn kind(&self) -> StoreKind {
        StoreKind::Relational
    }

    fn artifact_extension(&self) -> &'static str {
        self.options.compression.extension()
    }

    fn capture(&self) -> ArtifactStream {
        encode_entries(
            StoreKind::Relational,
            self.options.compression,
            self.entries(),
            ContentFingerprinter::default(),
        )
    }

    async fn restore(&self, artifact: Bytes) -> Result<RestoreSummary, DriverError> {
        let mut dump = RelationalDump::default();
        let summary = self.decode(&artifact, |entry| {
            match entry {
                RelationalEntry::Table(schema) => {
                    dump.rows.entry(schema.name.clone()).or_default();
                    dump.tables.push(schema);
                }
                RelationalEntry::Row { table, values } => dump.rows.entry(table).or_default().push(values),
            }
            Ok(())
        })?;

        for table in &dump.tables {
            if let Some(rows) = dump.rows.remove(&table.name) {
                dump.rows.insert(table.name.clone(), parent_first(table, rows));
            }
        }
        self.client.replace_all(&dump).await?;
        info!(
            tables = dump.tables.len(),
            rows = summary.entries - dump.tables.len() as u64,
            "Restored relational snapshot"
        );

        Ok(RestoreSummary {
            store_kind: StoreKind::Relational,
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
    use crate::driver::memory::{FaultPlan, MemoryRelational};
    use serde_json::json;

    fn schema() -> Vec<TableSchema> {
        vec![
            TableSchema::new("orders")
                .column("id", "bigint", false)
                .column("customer_id", "bigint", false)
                .primary_key(&["id"])
                .foreign_key(&["customer_id"], "customers", &["id"]),
            TableSchema::new("customers")
                .column("id", "bigint", false)
                .column("referrer", "bigint", true)
                .primary_key(&["id"])
                .foreign_key(&["referrer"], "customers", &["id"]),
        ]
    }

    fn row(pairs: &[(&str, Value)]) -> Row {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    fn seeded() -> MemoryRelational {
        let db = MemoryRelational::new(schema());
        db.insert("customers", row(&[("id", json!(1)), ("referrer", Value::Null)])).unwrap();
        db.insert("customers", row(&[("id", json!(2)), ("referrer", json!(1))])).unwrap();
        db.insert("orders", row(&[("id", json!(10)), ("customer_id", json!(2))])).unwrap();
        db
    }

    #[test]
    fn test_dependency_order_puts_parents_first() {
        let ordered = dependency_order(schema()).unwrap();
        let names: Vec<_> = ordered.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["customers", "orders"]);
    }

    #[test]
    fn test_dependency_cycle_rejected() {
        let tables = vec![
            TableSchema::new("a").foreign_key(&["b_id"], "b", &["id"]),
            TableSchema::new("b").foreign_key(&["a_id"], "a", &["id"]),
        ];
        assert!(matches!(dependency_order(tables), Err(DriverError::Unsupported(_))));
    }

    #[tokio::test]
    async fn test_restore_replaces_rows() {
        let source = seeded();
        let options = DriverOptions {
            page_size: 1,
            ..DriverOptions::default()
        };
        let chunks: Vec<Bytes> = RelationalDriver::new(Arc::new(source.clone()), options)
            .capture()
            .try_collect()
            .await
            .unwrap();

        let target = MemoryRelational::new(schema());
        target.insert("customers", row(&[("id", json!(77)), ("referrer", Value::Null)])).unwrap();
        let target_driver = RelationalDriver::new(Arc::new(target.clone()), options);
        let summary = target_driver.restore(Bytes::from(chunks.concat())).await.unwrap();

        assert_eq!(summary.entries, 5);
        assert_eq!(target.row_count("customers"), 2);
        assert_eq!(target.row_count("orders"), 1);
        assert_eq!(target_driver.fingerprint().await.unwrap(), summary.fingerprint);
    }

    #[test]
    fn test_parent_first_orders_self_references() {
        let employees = TableSchema::new("employees")
            .column("id", "bigint", false)
            .column("manager_id", "bigint", true)
            .primary_key(&["id"])
            .foreign_key(&["manager_id"], "employees", &["id"]);
        let rows = vec![
            row(&[("id", json!(1)), ("manager_id", json!(3))]),
            row(&[("id", json!(2)), ("manager_id", Value::Null)]),
            row(&[("id", json!(3)), ("manager_id", json!(2))]),
            row(&[("id", json!(4)), ("manager_id", json!(4))]),
        ];

        let ordered = parent_first(&employees, rows);
        let position = |id: i64| ordered.iter().position(|r| r["id"] == json!(id)).unwrap();
        assert_eq!(ordered.len(), 4);
        assert!(position(2) < position(3));
        assert!(position(3) < position(1));
    }

    #[tokio::test]
    async fn test_restore_replays_forward_self_references() {
        let employees = vec![TableSchema::new("employees")
            .column("id", "bigint", false)
            .column("manager_id", "bigint", true)
            .primary_key(&["id"])
            .foreign_key(&["manager_id"], "employees", &["id"])];
        let source = MemoryRelational::new(employees.clone());
        source.insert("employees", row(&[("id", json!(1)), ("manager_id", Value::Null)])).unwrap();
        source.insert("employees", row(&[("id", json!(2)), ("manager_id", json!(1))])).unwrap();
        source.insert("employees", row(&[("id", json!(3)), ("manager_id", Value::Null)])).unwrap();
        // Row 1 now points at a row captured after it
        source.update("employees", "id", &json!(1), "manager_id", json!(3)).unwrap();

        let chunks: Vec<Bytes> = RelationalDriver::new(Arc::new(source.clone()), DriverOptions::default())
            .capture()
            .try_collect()
            .await
            .unwrap();

        let target = MemoryRelational::new(employees);
        let target_driver = RelationalDriver::new(Arc::new(target.clone()), DriverOptions::default());
        let summary = target_driver.restore(Bytes::from(chunks.concat())).await.unwrap();

        assert_eq!(target.row_count("employees"), 3);
        assert_eq!(target_driver.fingerprint().await.unwrap(), summary.fingerprint);
    }

    #[tokio::test]
    async fn test_rejected_write_surfaces() {
        let source = seeded();
        let chunks: Vec<Bytes> = RelationalDriver::new(Arc::new(source), DriverOptions::default())
            .capture()
            .try_collect()
            .await
            .unwrap();

        let target = MemoryRelational::new(schema());
        target.set_faults(FaultPlan::reject_writes());
        let result = RelationalDriver::new(Arc::new(target), DriverOptions::default())
            .restore(Bytes::from(chunks.concat()))
            .await;
        assert!(matches!(result, Err(DriverError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_missing_target_table_rejected() {
        let source = seeded();
        let chunks: Vec<Bytes> = RelationalDriver::new(Arc::new(source), DriverOptions::default())
            .capture()
            .try_collect()
            .await
            .unwrap();

        let target = MemoryRelational::new(vec![TableSchema::new("customers")]);
        let result = RelationalDriver::new(Arc::new(target), DriverOptions::default())
            .restore(Bytes::from(chunks.concat()))
            .await;
        assert!(matches!(result, Err(DriverError::Rejected(_))));
    }
}
