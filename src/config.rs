// Configuration - JSON file, environment overrides and validation

use crate::artifact::format::Compression;
use crate::artifact::S3ArtifactConfig;
use crate::driver::{DriverOptions, Neo4jConfig, PostgresSourceConfig, QdrantConfig};
use crate::ledger::PostgresLedgerConfig;
use crate::orchestrator::BackupOptions;
use crate::types::RetentionPolicies;
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where ledger records live
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum LedgerConfig {
    /// Process-local; records vanish on exit
    #[default]
    Memory,
    /// Shared PostgreSQL table
    Postgres(PostgresLedgerConfig),
}

/// Where artifacts live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum ArtifactsConfig {
    /// Process-local; artifacts vanish on exit
    Memory,
    /// One file per key under `root`
    File {
        /// Directory holding the artifacts
        root: PathBuf,
    },
    /// S3 or an S3-compatible endpoint
    S3(S3ArtifactConfig),
}

impl Default for ArtifactsConfig {
    fn default() -> Self {
        ArtifactsConfig::File {
            root: PathBuf::from("./tristore-artifacts"),
        }
    }
}

/// Per-run settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Upper bound for capture plus upload; none means wait indefinitely
    pub timeout_secs: Option<u64>,
    /// Re-hash each artifact after upload
    pub verify_after_upload: bool,
    /// Compare fingerprints after `restore --all`
    pub verify_after_restore: bool,
    /// Entities per capture page
    pub page_size: usize,
    /// Entities per restore write
    pub write_batch: usize,
    /// Artifact compression
    pub compression: Compression,
}

impl Default for RunConfig {
    fn default() -> Self {
        let driver = DriverOptions::default();
        Self {
            timeout_secs: Some(4 * 3600),
            verify_after_upload: false,
            verify_after_restore: true,
            page_size: driver.page_size,
            write_batch: driver.write_batch,
            compression: driver.compression,
        }
    }
}

impl RunConfig {
    /// Driver settings derived from this section
    pub fn driver_options(&self) -> DriverOptions {
        DriverOptions {
            page_size: self.page_size,
            write_batch: self.write_batch,
            compression: self.compression,
        }
    }

    /// Backup settings derived from this section
    pub fn backup_options(&self) -> BackupOptions {
        let options = BackupOptions::new().verify_after_upload(self.verify_after_upload);
        match self.timeout_secs {
            Some(secs) => options.timeout(Duration::from_secs(secs)),
            None => options,
        }
    }
}

/// Complete configuration. A store section that is absent disables that kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TristoreConfig {
    /// Ledger backend
    pub ledger: LedgerConfig,
    /// Artifact backend
    pub artifacts: ArtifactsConfig,
    /// Qdrant source
    pub vector: Option<QdrantConfig>,
    /// Neo4j source
    pub graph: Option<Neo4jConfig>,
    /// PostgreSQL source
    pub relational: Option<PostgresSourceConfig>,
    /// Retention policies
    pub retention: RetentionPolicies,
    /// Run settings
    pub run: RunConfig,
}

impl TristoreConfig {
    /// Read a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Parse JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).context("Failed to parse configuration")
    }

    /// Apply `TRISTORE_*` environment overrides
    pub fn apply_env(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    /// Apply overrides from any lookup; used by `apply_env`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("TRISTORE_DATABASE_URL") {
            match &mut self.ledger {
                LedgerConfig::Postgres(config) => config.database_url = url,
                LedgerConfig::Memory => {
                    self.ledger = LedgerConfig::Postgres(PostgresLedgerConfig {
                        database_url: url,
                        ..PostgresLedgerConfig::default()
                    })
                }
            }
        }
        if let Some(root) = lookup("TRISTORE_ARTIFACT_DIR") {
            self.artifacts = ArtifactsConfig::File { root: PathBuf::from(root) };
        }
        if let Some(url) = lookup("TRISTORE_QDRANT_URL") {
            self.vector.get_or_insert_with(QdrantConfig::default).url = url;
        }
        if let Some(key) = lookup("TRISTORE_QDRANT_API_KEY") {
            self.vector.get_or_insert_with(QdrantConfig::default).api_key = Some(key);
        }
        if let Some(url) = lookup("TRISTORE_NEO4J_URL") {
            self.graph.get_or_insert_with(Neo4jConfig::default).url = url;
        }
        if let Some(user) = lookup("TRISTORE_NEO4J_USER") {
            self.graph.get_or_insert_with(Neo4jConfig::default).user = user;
        }
        if let Some(password) = lookup("TRISTORE_NEO4J_PASSWORD") {
            self.graph.get_or_insert_with(Neo4jConfig::default).password = Some(password);
        }
        if let Some(url) = lookup("TRISTORE_RELATIONAL_URL") {
            self.relational.get_or_insert_with(PostgresSourceConfig::default).database_url = url;
        }
    }

    /// Reject settings no run could succeed with
    pub fn validate(&self) -> Result<()> {
        if self.run.page_size == 0 {
            bail!("run.page_size must be positive");
        }
        if self.run.write_batch == 0 {
            bail!("run.write_batch must be positive");
        }
        if let Compression::Gzip(level) = self.run.compression {
            if level > 9 {
                bail!("run.compression level {} is above 9", level);
            }
        }
        if self.run.timeout_secs == Some(0) {
            bail!("run.timeout_secs must be positive when set");
        }

        match &self.artifacts {
            ArtifactsConfig::S3(s3) if s3.bucket_name.trim().is_empty() => bail!("artifacts.bucket_name is empty"),
            ArtifactsConfig::File { root } if root.as_os_str().is_empty() => bail!("artifacts.root is empty"),
            _ => {}
        }

        if let LedgerConfig::Postgres(ledger) = &self.ledger {
            if ledger.database_url.is_empty() {
                bail!("ledger.database_url is empty");
            }
        }
        if let Some(relational) = &self.relational {
            if relational.insert_batch == 0 {
                bail!("relational.insert_batch must be positive");
            }
        }
        if self.vector.is_none() && self.graph.is_none() && self.relational.is_none() {
            bail!("no store is configured; add a vector, graph or relational section");
        }
        Ok(())
    }
}
