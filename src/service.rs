//! Facade over ledger, artifact storage, drivers and orchestrators
//!
//! This is the surface the command line (or any other external caller)
//! drives: list, back up, restore, sweep and abandon.

use crate::artifact::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
use crate::config::{ArtifactsConfig, LedgerConfig, TristoreConfig};
use crate::driver::{
    DriverRegistry, GraphDriver, Neo4jClient, PostgresSource, QdrantClient, RelationalDriver, VectorDriver,
};
use crate::ledger::{BackupLedger, LedgerQuery, MemoryLedger, PostgresLedger};
use crate::orchestrator::{
    BackupOptions, BackupOrchestrator, BackupOutcome, RestoreMode, RestoreOrchestrator, RestoreOutcome,
    RestoreRequest,
};
use crate::retention::{RetentionSweeper, SweepReport};
use crate::types::{BackupRecord, RecordId, RetentionPolicies, StoreKind};
use crate::{BackupError, Result};
use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};

/// Everything needed to run backups, restores and sweeps
pub struct Tristore {
    ledger: Arc<dyn BackupLedger>,
    store: Arc<dyn ArtifactStore>,
    drivers: DriverRegistry,
    backups: BackupOrchestrator,
    restores: RestoreOrchestrator,
    retention: RetentionPolicies,
    verify_after_restore: bool,
}

impl Tristore {
    /// Facade over the given ports with default retention
    pub fn new(ledger: Arc<dyn BackupLedger>, store: Arc<dyn ArtifactStore>, drivers: DriverRegistry) -> Self {
        Self {
            backups: BackupOrchestrator::new(Arc::clone(&ledger), Arc::clone(&store), drivers.clone()),
            restores: RestoreOrchestrator::new(Arc::clone(&ledger), Arc::clone(&store), drivers.clone()),
            ledger,
            store,
            drivers,
            retention: RetentionPolicies::default(),
            verify_after_restore: true,
        }
    }

    /// Options applied to every backup run
    pub fn with_backup_options(mut self, options: BackupOptions) -> Self {
        self.backups = self.backups.with_options(options);
        self
    }

    /// Policies used by [`Tristore::sweep`]
    pub fn with_retention(mut self, retention: RetentionPolicies) -> Self {
        self.retention = retention;
        self
    }

    /// Compare live fingerprints after `restore_all` applies
    pub fn with_verify_after_restore(mut self, verify: bool) -> Self {
        self.verify_after_restore = verify;
        self
    }

    /// Build production adapters from configuration
    pub async fn connect(config: &TristoreConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let options = config.run.driver_options();

        let ledger: Arc<dyn BackupLedger> = match &config.ledger {
            LedgerConfig::Memory => Arc::new(MemoryLedger::new()),
            LedgerConfig::Postgres(postgres) => Arc::new(PostgresLedger::connect(postgres.clone()).await?),
        };

        let store: Arc<dyn ArtifactStore> = match &config.artifacts {
            ArtifactsConfig::Memory => Arc::new(MemoryArtifactStore::new()),
            ArtifactsConfig::File { root } => Arc::new(FileArtifactStore::new(root.clone())),
            #[cfg(feature = "s3")]
            ArtifactsConfig::S3(s3) => Arc::new(
                crate::artifact::S3ArtifactStore::new(s3.clone())
                    .await
                    .context("Failed to configure S3 artifact store")?,
            ),
            #[cfg(not(feature = "s3"))]
            ArtifactsConfig::S3(_) => anyhow::bail!("S3 artifact storage requires the `s3` feature"),
        };

        let mut drivers = DriverRegistry::new();
        if let Some(qdrant) = &config.vector {
            let client = QdrantClient::new(qdrant.clone()).context("Failed to configure Qdrant client")?;
            let mut driver = VectorDriver::new(Arc::new(client), options);
            if !qdrant.collections.is_empty() {
                driver = driver.with_collections(qdrant.collections.clone());
            }
            drivers.register(Arc::new(driver));
        }
        if let Some(neo4j) = &config.graph {
            let client = Neo4jClient::new(neo4j.clone()).context("Failed to configure Neo4j client")?;
            drivers.register(Arc::new(GraphDriver::new(Arc::new(client), options)));
        }
        if let Some(postgres) = &config.relational {
            let source = PostgresSource::connect(postgres.clone())
                .await
                .context("Failed to connect to the relational source")?;
            drivers.register(Arc::new(RelationalDriver::new(Arc::new(source), options)));
        }

        info!(
            artifacts = store.backend_name(),
            kinds = ?drivers.kinds(),
            "Tristore connected"
        );

        Ok(Self::new(ledger, store, drivers)
            .with_backup_options(config.run.backup_options())
            .with_retention(config.retention.clone())
            .with_verify_after_restore(config.run.verify_after_restore))
    }

    /// Store kinds with a registered driver
    pub fn kinds(&self) -> Vec<StoreKind> {
        self.drivers.kinds()
    }

    /// The backup ledger
    pub fn ledger(&self) -> &Arc<dyn BackupLedger> {
        &self.ledger
    }

    /// The artifact store
    pub fn store(&self) -> &Arc<dyn ArtifactStore> {
        &self.store
    }

    /// Ledger records matching `query`
    pub async fn list_backups(&self, query: &LedgerQuery) -> Result<Vec<BackupRecord>> {
        self.ledger.query(query).await.map_err(BackupError::from_ledger)
    }

    /// Back up one kind
    pub async fn backup(&self, kind: StoreKind) -> BackupOutcome {
        self.backups.run(kind).await
    }

    /// Back up every registered kind concurrently
    pub async fn backup_all(&self) -> Vec<BackupOutcome> {
        self.backups.run_all(&self.drivers.kinds()).await
    }

    /// Restore or validate one kind
    pub async fn restore(&self, request: RestoreRequest) -> RestoreOutcome {
        self.restores.restore(request).await
    }

    /// Restore every registered kind from its latest backup
    pub async fn restore_all(&self, mode: RestoreMode) -> Vec<RestoreOutcome> {
        self.restores.restore_all(mode, self.verify_after_restore).await
    }

    /// Sweep with the configured policies
    pub async fn sweep(&self) -> SweepReport {
        self.sweep_with(&self.retention).await
    }

    /// Sweep with explicit policies
    pub async fn sweep_with(&self, policies: &RetentionPolicies) -> SweepReport {
        RetentionSweeper::new(Arc::clone(&self.ledger), Arc::clone(&self.store))
            .sweep(policies)
            .await
    }

    /// Mark a stuck in-flight record failed so its kind is unblocked.
    /// Terminal records are returned unchanged.
    pub async fn abandon(&self, id: RecordId, reason: &str) -> Result<BackupRecord> {
        let record = self
            .ledger
            .get(id)
            .await
            .map_err(BackupError::from_ledger)?
            .ok_or(BackupError::RecordNotFound(id))?;
        if record.is_terminal() {
            return Ok(record);
        }

        warn!(record_id = %id, store_kind = %record.store_kind, reason = %reason, "Abandoning in-flight backup");
        self.ledger
            .fail(id, &format!("abandoned: {}", reason))
            .await
            .map_err(BackupError::from_ledger)
    }
}
