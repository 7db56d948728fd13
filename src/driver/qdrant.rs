//! Qdrant REST client for the vector driver

use super::vector::{CollectionConfig, CollectionInfo, PointId, ScrollPage, VectorIndexClient, VectorPoint, VectorsConfig};
use super::DriverError;
use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::debug;

/// Qdrant connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QdrantConfig {
    /// Base URL, e.g. `http://localhost:6333`
    pub url: String,
    /// Sent as the `api-key` header
    pub api_key: Option<String>,
    /// Per-request timeout
    pub request_timeout_secs: u64,
    /// Collections to back up; empty means all
    pub collections: Vec<String>,
}

impl Default for QdrantConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:6333".to_string(),
            api_key: None,
            request_timeout_secs: 60,
            collections: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Debug, Deserialize)]
struct CollectionsList {
    collections: Vec<CollectionName>,
}

#[derive(Debug, Deserialize)]
struct CollectionName {
    name: String,
}

#[derive(Debug, Deserialize)]
struct CollectionDescription {
    config: RemoteCollectionConfig,
}

#[derive(Debug, Deserialize)]
struct RemoteCollectionConfig {
    params: Map<String, Value>,
    #[serde(default)]
    hnsw_config: Option<Value>,
    #[serde(default)]
    optimizer_config: Option<Value>,
    #[serde(default)]
    wal_config: Option<Value>,
    #[serde(default)]
    quantization_config: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct CountResult {
    count: u64,
}

#[derive(Debug, Deserialize)]
struct RemoteScroll {
    points: Vec<RemotePoint>,
    next_page_offset: Option<PointId>,
}

#[derive(Debug, Deserialize)]
struct RemotePoint {
    id: PointId,
    #[serde(default)]
    vector: Value,
    #[serde(default)]
    payload: Option<BTreeMap<String, Value>>,
}

/// Qdrant client over the REST API
pub struct QdrantClient {
    http: reqwest::Client,
    config: QdrantConfig,
}

impl QdrantClient {
    /// Build the HTTP client
    pub fn new(config: QdrantConfig) -> Result<Self, DriverError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| DriverError::Unavailable(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { http, config })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.config.url.trim_end_matches('/'), path);
        let mut request = self.http.request(method, url);
        if let Some(ref key) = self.config.api_key {
            request = request.header("api-key", key);
        }
        request
    }

    /// Send a request; `Ok(None)` for 404
    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder, writing: bool) -> Result<Option<T>, DriverError> {
        let response = request
            .send()
            .await
            .map_err(|e| DriverError::Unavailable(format!("Qdrant request failed: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let detail = format!("Qdrant returned {}: {}", status, body);
            return Err(if writing && status.is_client_error() {
                DriverError::Rejected(detail)
            } else {
                DriverError::Unavailable(detail)
            });
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| DriverError::Inconsistent(format!("Unexpected Qdrant response: {}", e)))?;
        Ok(Some(envelope.result))
    }

    async fn count(&self, name: &str) -> Result<Option<u64>, DriverError> {
        let request = self
            .request(Method::POST, &format!("/collections/{}/points/count", name))
            .json(&json!({ "exact": true }));
        Ok(self.send::<CountResult>(request, false).await?.map(|r| r.count))
    }

    fn to_collection_config(name: &str, remote: RemoteCollectionConfig) -> Result<CollectionConfig, DriverError> {
        let mut params = remote.params;
        let vectors = params
            .remove("vectors")
            .ok_or_else(|| DriverError::Unsupported(format!("collection {} has no dense vectors", name)))?;
        let vectors: VectorsConfig = serde_json::from_value(vectors)
            .map_err(|e| DriverError::Unsupported(format!("collection {} vector config: {}", name, e)))?;

        let mut options: BTreeMap<String, Value> = params.into_iter().filter(|(_, v)| !v.is_null()).collect();
        let sections = [
            ("hnsw_config", remote.hnsw_config),
            // Reported as optimizer_config, accepted on create as optimizers_config
            ("optimizers_config", remote.optimizer_config),
            ("wal_config", remote.wal_config),
            ("quantization_config", remote.quantization_config),
        ];
        for (key, value) in sections {
            if let Some(value) = value.filter(|v| !v.is_null()) {
                options.insert(key.to_string(), value);
            }
        }

        Ok(CollectionConfig {
            name: name.to_string(),
            vectors,
            options,
        })
    }
}

#[async_trait]
impl VectorIndexClient for QdrantClient {
    async fn collections(&self) -> Result<Vec<String>, DriverError> {
        let list: CollectionsList = self
            .send(self.request(Method::GET, "/collections"), false)
            .await?
            .ok_or_else(|| DriverError::Unavailable("Qdrant collections endpoint not found".to_string()))?;
        Ok(list.collections.into_iter().map(|c| c.name).collect())
    }

    async fn collection(&self, name: &str) -> Result<Option<CollectionInfo>, DriverError> {
        let Some(description) = self
            .send::<CollectionDescription>(self.request(Method::GET, &format!("/collections/{}", name)), false)
            .await?
        else {
            return Ok(None);
        };

        let config = Self::to_collection_config(name, description.config)?;
        let points_count = self
            .count(name)
            .await?
            .ok_or_else(|| DriverError::Inconsistent(format!("collection {} vanished", name)))?;

        Ok(Some(CollectionInfo { config, points_count }))
    }

    async fn scroll(&self, name: &str, offset: Option<PointId>, limit: usize) -> Result<ScrollPage, DriverError> {
        let mut body = json!({
            "limit": limit,
            "with_payload": true,
            "with_vector": true,
        });
        if let Some(offset) = offset {
            body["offset"] = serde_json::to_value(offset)
                .map_err(|e| DriverError::Encoding(e.to_string()))?;
        }

        let page: RemoteScroll = self
            .send(
                self.request(Method::POST, &format!("/collections/{}/points/scroll", name)).json(&body),
                false,
            )
            .await?
            .ok_or_else(|| DriverError::Inconsistent(format!("collection {} vanished during scroll", name)))?;

        debug!(collection = %name, points = page.points.len(), "Scrolled Qdrant page");
        Ok(ScrollPage {
            points: page
                .points
                .into_iter()
                .map(|p| VectorPoint {
                    id: p.id,
                    vector: p.vector,
                    payload: p.payload.unwrap_or_default(),
                })
                .collect(),
            next_offset: page.next_page_offset,
        })
    }

    async fn drop_collection(&self, name: &str) -> Result<(), DriverError> {
        self.send::<Value>(self.request(Method::DELETE, &format!("/collections/{}", name)), true)
            .await?;
        Ok(())
    }

    async fn create_collection(&self, config: &CollectionConfig) -> Result<(), DriverError> {
        let mut body: Map<String, Value> = config.options.clone().into_iter().collect();
        body.insert(
            "vectors".to_string(),
            serde_json::to_value(&config.vectors).map_err(|e| DriverError::Encoding(e.to_string()))?,
        );

        self.send::<Value>(
            self.request(Method::PUT, &format!("/collections/{}", config.name)).json(&body),
            true,
        )
        .await?
        .ok_or_else(|| DriverError::Rejected(format!("Qdrant refused to create {}", config.name)))?;
        Ok(())
    }

    async fn upsert(&self, name: &str, points: &[VectorPoint]) -> Result<(), DriverError> {
        let body = json!({ "points": points });
        self.send::<Value>(
            self.request(Method::PUT, &format!("/collections/{}/points?wait=true", name)).json(&body),
            true,
        )
        .await?
        .ok_or_else(|| DriverError::Rejected(format!("collection {} not found", name)))?;
        Ok(())
    }
}
