// Backup Orchestrator - Requested → Capturing → Uploading → Recording → Succeeded

use crate::artifact::ArtifactStore;
use crate::driver::{DriverRegistry, StoreDriver};
use crate::integrity::{checksum_tee, IntegrityValidator};
use crate::ledger::BackupLedger;
use crate::metrics::{self, Timer};
use crate::types::{BackupRecord, BackupStatus, Completion, RecordId, StorageKey, StoreKind};
use crate::BackupError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, instrument, warn};

/// Last phase a backup run reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupPhase {
    /// Accepted, no record yet
    Requested,
    /// Record created, driver streaming
    Capturing,
    /// Bytes flowing into the artifact store
    Uploading,
    /// Writing the completion to the ledger
    Recording,
    /// Recorded as succeeded
    Succeeded,
}

impl fmt::Display for BackupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackupPhase::Requested => "requested",
            BackupPhase::Capturing => "capturing",
            BackupPhase::Uploading => "uploading",
            BackupPhase::Recording => "recording",
            BackupPhase::Succeeded => "succeeded",
        };
        f.write_str(name)
    }
}

/// Backup run options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BackupOptions {
    /// Upper bound for capture plus upload
    pub timeout: Option<Duration>,
    /// Download and re-hash the artifact before recording success
    pub verify_after_upload: bool,
}

impl BackupOptions {
    /// No timeout, no verification
    pub fn new() -> Self {
        Self::default()
    }

    /// Bound the capture plus upload
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Re-hash the stored artifact before recording
    pub fn verify_after_upload(mut self, verify: bool) -> Self {
        self.verify_after_upload = verify;
        self
    }
}

/// Result of one backup run
#[derive(Debug)]
pub struct BackupOutcome {
    /// Store kind backed up
    pub store_kind: StoreKind,
    /// Absent when the run never got a ledger record
    pub record_id: Option<RecordId>,
    /// Phase reached on success, or the phase that failed
    pub phase: BackupPhase,
    /// The succeeded record, or why the run failed
    pub result: Result<BackupRecord, BackupError>,
}

impl BackupOutcome {
    /// The run succeeded
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// The failure, if any
    pub fn error(&self) -> Option<&BackupError> {
        self.result.as_ref().err()
    }

    /// `succeeded` or the error category
    pub fn status_label(&self) -> &'static str {
        match &self.result {
            Ok(_) => "succeeded",
            Err(e) => e.category(),
        }
    }
}

/// Drives one backup run per call
pub struct BackupOrchestrator {
    ledger: Arc<dyn BackupLedger>,
    store: Arc<dyn ArtifactStore>,
    drivers: DriverRegistry,
    validator: IntegrityValidator,
    options: BackupOptions,
}

/// A run that has a ledger record and possibly a written key
struct InFlight {
    kind: StoreKind,
    id: RecordId,
    key: String,
}

impl InFlight {
    /// The record is our succeeded run pointing at our key
    fn owns(&self, record: &BackupRecord) -> bool {
        record.status == BackupStatus::Succeeded && record.storage_key.as_deref() == Some(self.key.as_str())
    }
}

impl BackupOrchestrator {
    /// Orchestrator with default options
    pub fn new(ledger: Arc<dyn BackupLedger>, store: Arc<dyn ArtifactStore>, drivers: DriverRegistry) -> Self {
        Self {
            ledger,
            store,
            drivers,
            validator: IntegrityValidator::new(),
            options: BackupOptions::default(),
        }
    }

    /// Replace the run options
    pub fn with_options(mut self, options: BackupOptions) -> Self {
        self.options = options;
        self
    }

    /// Current run options
    pub fn options(&self) -> BackupOptions {
        self.options
    }

    /// Run one backup of `kind` to completion
    #[instrument(skip(self), fields(store_kind = %kind))]
    pub async fn run(&self, kind: StoreKind) -> BackupOutcome {
        let timer = Timer::start();
        let outcome = self.execute(kind).await;
        metrics::record_backup(kind, outcome.status_label(), timer.elapsed_secs());
        outcome
    }

    /// Back up several kinds concurrently, one outcome per kind
    pub async fn run_all(&self, kinds: &[StoreKind]) -> Vec<BackupOutcome> {
        futures::future::join_all(kinds.iter().map(|kind| self.run(*kind))).await
    }

    async fn execute(&self, kind: StoreKind) -> BackupOutcome {
        let rejected = |error: BackupError| {
            warn!(store_kind = %kind, error = %error, "Backup rejected before capture");
            BackupOutcome {
                store_kind: kind,
                record_id: None,
                phase: BackupPhase::Requested,
                result: Err(error),
            }
        };

        let Some(driver) = self.drivers.get(kind) else {
            return rejected(BackupError::DriverMissing(kind));
        };

        // Requested → Capturing: a conflict never reaches the driver
        let record = match self.ledger.begin(kind).await {
            Ok(record) => record,
            Err(e) => return rejected(BackupError::from_ledger(e)),
        };

        let run = InFlight {
            kind,
            id: record.id,
            key: StorageKey::new(kind, record.started_at, record.id, driver.artifact_extension()).to_string(),
        };
        info!(record_id = %run.id, key = %run.key, "Backup started");

        match self.transfer(&run, driver.as_ref()).await {
            Ok(completion) => self.record(run, completion).await,
            Err((phase, error)) => self.abort(run, phase, error).await,
        }
    }

    /// Capturing → Uploading: one pass of the driver's bytes through the
    /// checksum tee into the artifact store
    async fn transfer(&self, run: &InFlight, driver: &dyn StoreDriver) -> Result<Completion, (BackupPhase, BackupError)> {
        self.ledger
            .mark_running(run.id)
            .await
            .map_err(|e| (BackupPhase::Capturing, BackupError::from_ledger(e)))?;

        let (upload, tee) = checksum_tee(driver.capture());
        let put = self.store.put(&run.key, upload);
        let stored = match self.options.timeout {
            Some(limit) => match tokio::time::timeout(limit, put).await {
                Ok(stored) => stored,
                Err(_) => {
                    // The capture stream was dropped with the put future
                    let phase = if tee.finish().1 == 0 {
                        BackupPhase::Capturing
                    } else {
                        BackupPhase::Uploading
                    };
                    return Err((phase, BackupError::Timeout(limit)));
                }
            },
            None => put.await,
        };

        let size = stored.map_err(|e| match tee.take_source_error() {
            Some(source) => (BackupPhase::Capturing, BackupError::Capture { kind: run.kind, source }),
            None => (BackupPhase::Uploading, BackupError::Upload(e)),
        })?;

        let (checksum, streamed) = tee.finish();
        if size != streamed {
            return Err((
                BackupPhase::Uploading,
                BackupError::Upload(crate::artifact::ArtifactError::Storage(format!(
                    "store acknowledged {} bytes but {} were streamed",
                    size, streamed
                ))),
            ));
        }
        info!(record_id = %run.id, size_bytes = size, checksum = %checksum, "Artifact uploaded");

        if self.options.verify_after_upload {
            let verification = self
                .validator
                .verify_stored(self.store.as_ref(), &run.key, &checksum)
                .await
                .map_err(|e| (BackupPhase::Uploading, BackupError::Upload(e)))?;
            if !verification.is_match() {
                return Err((
                    BackupPhase::Uploading,
                    BackupError::ChecksumMismatch {
                        key: run.key.clone(),
                        expected: verification.expected,
                        actual: verification.actual,
                    },
                ));
            }
        }

        Ok(Completion {
            size_bytes: size,
            checksum,
            storage_key: run.key.clone(),
        })
    }

    /// Uploading → Recording → Succeeded
    async fn record(&self, run: InFlight, completion: Completion) -> BackupOutcome {
        let size = completion.size_bytes;
        match self.ledger.complete(run.id, completion).await {
            Ok(record) if run.owns(&record) => self.succeeded(run, record, size),
            // Already terminal without our key: abandoned while running
            Ok(_) => {
                let error = BackupError::Ledger(crate::ledger::LedgerError::Terminal(run.id));
                self.abort(run, BackupPhase::Recording, error).await
            }
            Err(e) => {
                // The write may have committed before the error surfaced
                match self.ledger.get(run.id).await {
                    Ok(Some(record)) if run.owns(&record) => {
                        warn!(record_id = %run.id, error = %e, "Ledger reported an error after recording success");
                        self.succeeded(run, record, size)
                    }
                    // Unknown ledger state: the artifact stays for orphan reconciliation
                    _ => self.fail(run, BackupPhase::Recording, BackupError::from_ledger(e)).await,
                }
            }
        }
    }

    fn succeeded(&self, run: InFlight, record: BackupRecord, size: u64) -> BackupOutcome {
        metrics::record_artifact_bytes(run.kind, size);
        info!(record_id = %run.id, "Backup succeeded");
        BackupOutcome {
            store_kind: run.kind,
            record_id: Some(run.id),
            phase: BackupPhase::Succeeded,
            result: Ok(record),
        }
    }

    /// Any phase → Failed: drop the artifact, then mark the record failed
    async fn abort(&self, run: InFlight, phase: BackupPhase, error: BackupError) -> BackupOutcome {
        if let Err(e) = self.store.delete(&run.key).await {
            warn!(key = %run.key, error = %e, "Failed to remove artifact of failed backup");
        }
        self.fail(run, phase, error).await
    }

    /// Mark the record failed, leaving any written artifact in place
    async fn fail(&self, run: InFlight, phase: BackupPhase, error: BackupError) -> BackupOutcome {
        error!(record_id = %run.id, phase = %phase, category = error.category(), error = %error, "Backup failed");

        if let Err(e) = self.ledger.fail(run.id, &error.to_string()).await {
            warn!(record_id = %run.id, error = %e, "Failed to mark backup record failed");
        }

        BackupOutcome {
            store_kind: run.kind,
            record_id: Some(run.id),
            phase,
            result: Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::MemoryArtifactStore;
    use crate::driver::{DriverOptions, GraphDriver, MemoryGraph};
    use crate::ledger::{LedgerQuery, MemoryLedger};
    use serde_json::json;

    fn setup(graph: MemoryGraph) -> (Arc<MemoryLedger>, Arc<MemoryArtifactStore>, BackupOrchestrator) {
        let ledger = Arc::new(MemoryLedger::new());
        let store = Arc::new(MemoryArtifactStore::new());
        let drivers = DriverRegistry::new().with(Arc::new(GraphDriver::new(Arc::new(graph), DriverOptions::default())));
        let orchestrator = BackupOrchestrator::new(ledger.clone(), store.clone(), drivers);
        (ledger, store, orchestrator)
    }

    #[tokio::test]
    async fn test_backup_records_checksum_of_stored_bytes() {
        let graph = MemoryGraph::new();
        let a = graph.add_node(&["Person"], [("name".to_string(), json!("Ada"))].into());
        let b = graph.add_node(&["Person"], [("name".to_string(), json!("Bob"))].into());
        graph.add_relationship(a, b, "KNOWS", Default::default());

        let (_, store, orchestrator) = setup(graph);
        let outcome = orchestrator.run(StoreKind::Graph).await;
        assert_eq!(outcome.phase, BackupPhase::Succeeded);

        let record = outcome.result.unwrap();
        let key = record.storage_key.clone().unwrap();
        assert!(key.starts_with("graph/"));
        let stored = store.get(&key).await.unwrap();
        assert_eq!(record.size_bytes, Some(stored.len() as u64));
        assert_eq!(record.checksum, Some(crate::integrity::Checksum::of(&stored)));
    }

    #[tokio::test]
    async fn test_missing_driver_rejected_without_record() {
        let (ledger, _, orchestrator) = setup(MemoryGraph::new());
        let outcome = orchestrator.run(StoreKind::Vector).await;
        assert!(matches!(outcome.error(), Some(BackupError::DriverMissing(StoreKind::Vector))));
        assert!(outcome.record_id.is_none());
        assert!(ledger.is_empty());
    }

    #[tokio::test]
    async fn test_upload_failure_marks_record_failed() {
        let (ledger, store, orchestrator) = setup(MemoryGraph::new());
        store.fail_puts(true);

        let outcome = orchestrator.run(StoreKind::Graph).await;
        assert_eq!(outcome.phase, BackupPhase::Uploading);
        assert_eq!(outcome.status_label(), "upload");

        let records = ledger.query(&LedgerQuery::all()).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].status, BackupStatus::Failed);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_verify_after_upload_succeeds() {
        let (_, _, orchestrator) = setup(MemoryGraph::new());
        let orchestrator = orchestrator.with_options(BackupOptions::new().verify_after_upload(true));
        assert!(orchestrator.run(StoreKind::Graph).await.is_success());
    }
}
