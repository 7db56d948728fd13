//! Neo4j client over the HTTP transactional Cypher endpoint

use super::graph::{GraphClient, GraphCounts, GraphDump, GraphNode, GraphRelationship};
use super::DriverError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Temporary label and property used to rewire relationships during a restore
const RESTORE_LABEL: &str = "__TristoreRestore";
const RESTORE_ID: &str = "__tristore_id";

/// Neo4j HTTP API settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    /// HTTP base URL, e.g. `http://localhost:7474`
    pub url: String,
    /// Database name
    pub database: String,
    /// Basic auth user
    pub user: String,
    /// Basic auth password
    pub password: Option<String>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:7474".to_string(),
            database: "neo4j".to_string(),
            user: "neo4j".to_string(),
            password: None,
            request_timeout_secs: 300,
        }
    }
}

#[derive(Debug, Serialize)]
struct Statement {
    statement: String,
    parameters: Value,
}

#[derive(Debug, Deserialize)]
struct TxResponse {
    #[serde(default)]
    results: Vec<StatementResult>,
    #[serde(default)]
    errors: Vec<TxError>,
}

#[derive(Debug, Deserialize)]
struct StatementResult {
    #[serde(default)]
    data: Vec<ResultRow>,
}

#[derive(Debug, Deserialize)]
struct ResultRow {
    row: Vec<Value>,
}

#[derive(Debug, Deserialize)]
struct TxError {
    code: String,
    message: String,
}

/// Neo4j client over the HTTP transactional Cypher endpoint
pub struct Neo4jClient {
    http: reqwest::Client,
    config: Neo4jConfig,
}

impl Neo4jClient {
    /// Build the HTTP client
    pub fn new(config: Neo4jConfig) -> Result<Self, DriverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DriverError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    /// Run statements in one auto-committed transaction
    async fn run(&self, statements: Vec<Statement>) -> Result<Vec<StatementResult>, DriverError> {
        let url = format!(
            "{}/db/{}/tx/commit",
            self.config.url.trim_end_matches('/'),
            self.config.database
        );
        let response = self
            .http
            .post(url)
            .basic_auth(&self.config.user, self.config.password.as_deref())
            .json(&json!({ "statements": statements }))
            .send()
            .await
            .map_err(|e| DriverError::Unavailable(format!("Neo4j request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DriverError::Unavailable(format!("Neo4j returned {}: {}", status, body)));
        }

        let body: TxResponse = response
            .json()
            .await
            .map_err(|e| DriverError::Inconsistent(format!("Unexpected Neo4j response: {}", e)))?;

        if let Some(error) = body.errors.first() {
            let detail = format!("{}: {}", error.code, error.message);
            return Err(if error.code.contains("ClientError") {
                DriverError::Rejected(detail)
            } else {
                DriverError::Unavailable(detail)
            });
        }
        Ok(body.results)
    }

    async fn query(&self, statement: &str, parameters: Value) -> Result<Vec<Vec<Value>>, DriverError> {
        let mut results = self
            .run(vec![Statement {
                statement: statement.to_string(),
                parameters,
            }])
            .await?;
        let result = results.pop().unwrap_or(StatementResult { data: Vec::new() });
        Ok(result.data.into_iter().map(|r| r.row).collect())
    }
}

fn escape_identifier(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn as_i64(value: &Value, what: &str) -> Result<i64, DriverError> {
    value
        .as_i64()
        .ok_or_else(|| DriverError::Inconsistent(format!("expected integer {}, got {}", what, value)))
}

fn as_properties(value: Value) -> Result<BTreeMap<String, Value>, DriverError> {
    match value {
        Value::Object(map) => Ok(map.into_iter().collect()),
        Value::Null => Ok(BTreeMap::new()),
        other => Err(DriverError::Inconsistent(format!("expected property map, got {}", other))),
    }
}

/// Build the statements that replace the whole graph, grouping CREATEs by
/// label set and relationship type so each group is one UNWIND
fn restore_statements(dump: &GraphDump) -> Vec<Statement> {
    let mut statements = vec![Statement {
        statement: "MATCH (n) DETACH DELETE n".to_string(),
        parameters: json!({}),
    }];

    let mut by_labels: BTreeMap<Vec<String>, Vec<Value>> = BTreeMap::new();
    for node in &dump.nodes {
        let mut labels = node.labels.clone();
        labels.sort();
        by_labels
            .entry(labels)
            .or_default()
            .push(json!({ "id": node.id, "properties": node.properties }));
    }
    for (labels, nodes) in by_labels {
        let label_list: String = labels
            .iter()
            .map(|l| format!(":{}", escape_identifier(l)))
            .chain(std::iter::once(format!(":{}", RESTORE_LABEL)))
            .collect();
        statements.push(Statement {
            statement: format!(
                "UNWIND $nodes AS n CREATE (x{}) SET x = n.properties, x.{} = n.id",
                label_list, RESTORE_ID
            ),
            parameters: json!({ "nodes": nodes }),
        });
    }

    let mut by_type: BTreeMap<&str, Vec<Value>> = BTreeMap::new();
    for rel in &dump.relationships {
        by_type.entry(rel.rel_type.as_str()).or_default().push(json!({
            "start": rel.start,
            "end": rel.end,
            "properties": rel.properties,
        }));
    }
    for (rel_type, rels) in by_type {
        statements.push(Statement {
            statement: format!(
                "UNWIND $rels AS r \
                 MATCH (a:{label} {{{id}: r.start}}), (b:{label} {{{id}: r.end}}) \
                 CREATE (a)-[x:{rel_type}]->(b) SET x = r.properties",
                label = RESTORE_LABEL,
                id = RESTORE_ID,
                rel_type = escape_identifier(rel_type),
            ),
            parameters: json!({ "rels": rels }),
        });
    }

    statements.push(Statement {
        statement: format!(
            "MATCH (n:{label}) REMOVE n:{label}, n.{id}",
            label = RESTORE_LABEL,
            id = RESTORE_ID
        ),
        parameters: json!({}),
    });
    statements
}

#[async_trait]
impl GraphClient for Neo4jClient {
    async fn counts(&self) -> Result<GraphCounts, DriverError> {
        let results = self
            .run(vec![
                Statement {
                    statement: "MATCH (n) RETURN count(n)".to_string(),
                    parameters: json!({}),
                },
                Statement {
                    statement: "MATCH ()-[r]->() RETURN count(r)".to_string(),
                    parameters: json!({}),
                },
            ])
            .await?;

        let count = |index: usize| -> Result<u64, DriverError> {
            results
                .get(index)
                .and_then(|r| r.data.first())
                .and_then(|row| row.row.first())
                .and_then(Value::as_u64)
                .ok_or_else(|| DriverError::Inconsistent("missing count in Neo4j response".to_string()))
        };

        Ok(GraphCounts {
            nodes: count(0)?,
            relationships: count(1)?,
        })
    }

    async fn nodes(&self, skip: u64, limit: usize) -> Result<Vec<GraphNode>, DriverError> {
        let rows = self
            .query(
                "MATCH (n) RETURN id(n), labels(n), properties(n) ORDER BY id(n) SKIP $skip LIMIT $limit",
                json!({ "skip": skip, "limit": limit }),
            )
            .await?;

        rows.into_iter()
            .map(|mut row| {
                if row.len() != 3 {
                    return Err(DriverError::Inconsistent("unexpected node row shape".to_string()));
                }
                let properties = as_properties(row.pop().unwrap_or(Value::Null))?;
                let labels: Vec<String> = serde_json::from_value(row.pop().unwrap_or(Value::Null))
                    .map_err(|e| DriverError::Inconsistent(format!("node labels: {}", e)))?;
                let id = as_i64(&row[0], "node id")?;
                Ok(GraphNode { id, labels, properties })
            })
            .collect()
    }

    async fn relationships(&self, skip: u64, limit: usize) -> Result<Vec<GraphRelationship>, DriverError> {
        let rows = self
            .query(
                "MATCH (a)-[r]->(b) RETURN id(r), id(a), id(b), type(r), properties(r) \
                 ORDER BY id(r) SKIP $skip LIMIT $limit",
                json!({ "skip": skip, "limit": limit }),
            )
            .await?;

        rows.into_iter()
            .map(|mut row| {
                if row.len() != 5 {
                    return Err(DriverError::Inconsistent("unexpected relationship row shape".to_string()));
                }
                let properties = as_properties(row.pop().unwrap_or(Value::Null))?;
                let rel_type = row
                    .pop()
                    .and_then(|v| v.as_str().map(str::to_string))
                    .ok_or_else(|| DriverError::Inconsistent("relationship type is not a string".to_string()))?;
                Ok(GraphRelationship {
                    id: as_i64(&row[0], "relationship id")?,
                    start: as_i64(&row[1], "start node id")?,
                    end: as_i64(&row[2], "end node id")?,
                    rel_type,
                    properties,
                })
            })
            .collect()
    }

    async fn replace_graph(&self, dump: &GraphDump) -> Result<(), DriverError> {
        let statements = restore_statements(dump);
        debug!(statements = statements.len(), "Replacing Neo4j graph in one transaction");
        self.run(statements).await?;
        Ok(())
    }
}
