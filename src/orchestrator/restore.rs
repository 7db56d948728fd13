// Restore Orchestrator - Requested → Resolving → Downloading → Validating → (Restoring | ValidatedOnly) → Succeeded

use crate::artifact::ArtifactStore;
use crate::driver::{DriverRegistry, StoreDriver};
use crate::integrity::{IntegrityValidator, RestoreCheck};
use crate::ledger::{select_latest, BackupLedger, LedgerQuery};
use crate::metrics::{self, Timer};
use crate::types::{BackupRecord, BackupStatus, RecordId, RestoreSelector, StoreKind};
use crate::BackupError;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

/// Whether a restore writes to the target store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Write the artifact into the target store
    Apply,
    /// Resolve, download and validate, then stop before any write
    ValidateOnly,
}

impl RestoreMode {
    /// Stable label for logs and metrics
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMode::Apply => "apply",
            RestoreMode::ValidateOnly => "validate_only",
        }
    }
}

/// Last phase a restore run reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestorePhase {
    /// Accepted
    Requested,
    /// Selecting the record
    Resolving,
    /// Fetching the artifact
    Downloading,
    /// Checking checksum, size and format
    Validating,
    /// Writing into the target store
    Restoring,
    /// Validated without writing
    ValidatedOnly,
    /// Restored
    Succeeded,
}

impl fmt::Display for RestorePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestorePhase::Requested => "requested",
            RestorePhase::Resolving => "resolving",
            RestorePhase::Downloading => "downloading",
            RestorePhase::Validating => "validating",
            RestorePhase::Restoring => "restoring",
            RestorePhase::ValidatedOnly => "validated_only",
            RestorePhase::Succeeded => "succeeded",
        };
        f.write_str(name)
    }
}

/// What to restore and how
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestoreRequest {
    /// Which record to restore
    pub selector: RestoreSelector,
    /// Apply or validate only
    pub mode: RestoreMode,
    /// Compare the live store fingerprint with the artifact after writing
    pub verify_after: bool,
}

impl RestoreRequest {
    /// Apply `selector` with post-restore verification
    pub fn new(selector: RestoreSelector) -> Self {
        Self {
            selector,
            mode: RestoreMode::Apply,
            verify_after: true,
        }
    }

    /// Restore the latest backup of `kind`
    pub fn latest(kind: StoreKind) -> Self {
        Self::new(RestoreSelector::Latest(kind))
    }

    /// Restore a specific record
    pub fn explicit(kind: StoreKind, id: RecordId) -> Self {
        Self::new(RestoreSelector::Explicit { kind, id })
    }

    /// Set the mode
    pub fn mode(mut self, mode: RestoreMode) -> Self {
        self.mode = mode;
        self
    }

    /// Validate without writing
    pub fn validate_only(self) -> Self {
        self.mode(RestoreMode::ValidateOnly)
    }

    /// Toggle post-restore fingerprint comparison
    pub fn verify_after(mut self, verify: bool) -> Self {
        self.verify_after = verify;
        self
    }
}

/// Result of one restore run
#[derive(Debug)]
pub struct RestoreOutcome {
    /// Store kind restored
    pub store_kind: StoreKind,
    /// Mode the run used
    pub mode: RestoreMode,
    /// The record the selector resolved to, once resolved
    pub record: Option<BackupRecord>,
    /// Phase reached on success, or the phase that failed
    pub phase: RestorePhase,
    /// Advisory post-restore comparison; never changes `result`
    pub check: Option<RestoreCheck>,
    /// Success, or why the run failed
    pub result: Result<(), BackupError>,
}

impl RestoreOutcome {
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

/// Drives one restore run per call
pub struct RestoreOrchestrator {
    ledger: Arc<dyn BackupLedger>,
    store: Arc<dyn ArtifactStore>,
    drivers: DriverRegistry,
    validator: IntegrityValidator,
}

/// Mutable state of a run as it moves through the phases
struct Run {
    outcome: RestoreOutcome,
}

impl Run {
    fn enter(&mut self, phase: RestorePhase) {
        info!(store_kind = %self.outcome.store_kind, phase = %phase, "Restore phase");
        self.outcome.phase = phase;
    }

    fn fail(mut self, error: BackupError) -> RestoreOutcome {
        error!(
            store_kind = %self.outcome.store_kind,
            phase = %self.outcome.phase,
            category = error.category(),
            error = %error,
            "Restore failed"
        );
        self.outcome.result = Err(error);
        self.outcome
    }
}

impl RestoreOrchestrator {
    /// Orchestrator over the given ports
    pub fn new(ledger: Arc<dyn BackupLedger>, store: Arc<dyn ArtifactStore>, drivers: DriverRegistry) -> Self {
        Self {
            ledger,
            store,
            drivers,
            validator: IntegrityValidator::new(),
        }
    }

    /// Run one restore to completion
    #[instrument(skip(self, request), fields(store_kind = %request.selector.kind(), mode = request.mode.as_str()))]
    pub async fn restore(&self, request: RestoreRequest) -> RestoreOutcome {
        let timer = Timer::start();
        let outcome = self.execute(request).await;
        metrics::record_restore(
            outcome.store_kind,
            request.mode.as_str(),
            outcome.status_label(),
            timer.elapsed_secs(),
        );
        outcome
    }

    /// Restore the latest backup of every registered kind. Outcomes are
    /// reported per kind; one kind failing does not stop the others.
    pub async fn restore_all(&self, mode: RestoreMode, verify_after: bool) -> Vec<RestoreOutcome> {
        let requests = self
            .drivers
            .kinds()
            .into_iter()
            .map(|kind| RestoreRequest::latest(kind).mode(mode).verify_after(verify_after));
        futures::future::join_all(requests.map(|request| self.restore(request))).await
    }

    async fn execute(&self, request: RestoreRequest) -> RestoreOutcome {
        let kind = request.selector.kind();
        let mut run = Run {
            outcome: RestoreOutcome {
                store_kind: kind,
                mode: request.mode,
                record: None,
                phase: RestorePhase::Requested,
                check: None,
                result: Ok(()),
            },
        };
        info!(selector = %request.selector, "Restore requested");

        let Some(driver) = self.drivers.get(kind) else {
            return run.fail(BackupError::DriverMissing(kind));
        };

        run.enter(RestorePhase::Resolving);
        let record = match self.resolve(request.selector).await {
            Ok(record) => record,
            Err(e) => return run.fail(e),
        };
        info!(record_id = %record.id, completed_at = ?record.completed_at, "Resolved backup record");
        run.outcome.record = Some(record.clone());

        run.enter(RestorePhase::Downloading);
        let payload = match self.download(&record).await {
            Ok(payload) => payload,
            Err(e) => return run.fail(e),
        };

        // Validating runs in every mode, before anything is written
        run.enter(RestorePhase::Validating);
        if let Err(e) = self.validate(&record, &payload, driver.as_ref()).await {
            return run.fail(e);
        }

        if request.mode == RestoreMode::ValidateOnly {
            run.enter(RestorePhase::ValidatedOnly);
            info!(record_id = %record.id, "Artifact validated, target left untouched");
            return run.outcome;
        }

        run.enter(RestorePhase::Restoring);
        let summary = match driver.restore(payload).await {
            Ok(summary) => summary,
            Err(source) => return run.fail(BackupError::Restore { kind, source }),
        };
        info!(record_id = %record.id, entries = summary.entries, "Target store restored");

        if request.verify_after {
            match self.validator.verify_restored(driver.as_ref(), &summary.fingerprint).await {
                Ok(check) => run.outcome.check = Some(check),
                Err(e) => warn!(error = %e, "Post-restore fingerprint unavailable"),
            }
        }

        run.enter(RestorePhase::Succeeded);
        run.outcome
    }

    /// Turn the selector into exactly one succeeded record
    async fn resolve(&self, selector: RestoreSelector) -> Result<BackupRecord, BackupError> {
        match selector {
            RestoreSelector::Latest(kind) => {
                let candidates = self
                    .ledger
                    .query(&LedgerQuery::all().kind(kind).status(BackupStatus::Succeeded))
                    .await
                    .map_err(BackupError::from_ledger)?;
                select_latest(&candidates).cloned().ok_or(BackupError::NoBackups(kind))
            }
            RestoreSelector::Explicit { kind, id } => {
                let record = self.ledger.get(id).await.map_err(BackupError::from_ledger)?;
                record
                    .filter(|r| r.store_kind == kind && r.status == BackupStatus::Succeeded)
                    .ok_or(BackupError::RecordNotFound(id))
            }
        }
    }

    async fn download(&self, record: &BackupRecord) -> Result<Bytes, BackupError> {
        let key = record.storage_key.as_deref().ok_or_else(|| BackupError::CorruptArtifact {
            key: String::new(),
            detail: format!("record {} has no storage key", record.id),
        })?;

        self.store.get(key).await.map_err(|e| {
            if e.is_not_found() {
                BackupError::ArtifactMissing {
                    record: record.id,
                    key: key.to_string(),
                }
            } else {
                BackupError::Download(e)
            }
        })
    }

    /// Checksum, then size, then a full decode by the driver
    async fn validate(&self, record: &BackupRecord, payload: &Bytes, driver: &dyn StoreDriver) -> Result<(), BackupError> {
        let key = record.storage_key.clone().unwrap_or_default();
        let expected = record.checksum.as_ref().ok_or_else(|| BackupError::CorruptArtifact {
            key: key.clone(),
            detail: "record has no checksum".to_string(),
        })?;

        let verification = self.validator.verify_bytes(payload, expected);
        if !verification.is_match() {
            return Err(BackupError::ChecksumMismatch {
                key,
                expected: verification.expected,
                actual: verification.actual,
            });
        }

        if let Some(size) = record.size_bytes {
            if size != verification.size_bytes {
                return Err(BackupError::CorruptArtifact {
                    key,
                    detail: format!("expected {} bytes, found {}", size, verification.size_bytes),
                });
            }
        }

        let summary = driver.inspect(payload).await.map_err(|e| BackupError::CorruptArtifact {
            key: key.clone(),
            detail: e.to_string(),
        })?;
        info!(key = %key, entries = summary.entries, fingerprint = %summary.fingerprint, "Artifact validated");
        Ok(())
    }
}
