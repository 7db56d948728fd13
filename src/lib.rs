//! # tristore
//!
//! Consistent, verifiable backup and restore for a vector index, a graph
//! database and a relational database, tracked in one ledger.
//!
//! ## Overview
//!
//! Each store kind is captured independently by a [`driver::StoreDriver`]
//! into a self-describing artifact, streamed through a SHA-256 tee into an
//! [`artifact::ArtifactStore`], and recorded in a [`ledger::BackupLedger`].
//! Restores resolve exactly one record, verify the downloaded bytes before
//! any destructive write, and optionally compare a fingerprint of the live
//! store with the one captured at backup time.
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use tristore::artifact::MemoryArtifactStore;
//! use tristore::driver::{DriverRegistry, GraphDriver, MemoryGraph, DriverOptions};
//! use tristore::ledger::MemoryLedger;
//! use tristore::orchestrator::RestoreRequest;
//! use tristore::service::Tristore;
//! use tristore::types::StoreKind;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let graph = MemoryGraph::new();
//! let drivers = DriverRegistry::new()
//!     .with(Arc::new(GraphDriver::new(Arc::new(graph), DriverOptions::default())));
//! let tristore = Tristore::new(Arc::new(MemoryLedger::new()), Arc::new(MemoryArtifactStore::new()), drivers);
//!
//! let backup = tristore.backup(StoreKind::Graph).await;
//! assert!(backup.is_success());
//!
//! let restore = tristore.restore(RestoreRequest::latest(StoreKind::Graph).validate_only()).await;
//! assert!(restore.is_success());
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: store kinds, ledger records, selectors and retention policies
//! - [`integrity`]: checksums, streaming tee and store fingerprints
//! - [`artifact`]: artifact format and blob stores
//! - [`ledger`]: backup ledger with atomic per-kind mutual exclusion
//! - [`driver`]: capture and restore per store kind
//! - [`orchestrator`]: backup and restore state machines
//! - [`retention`]: retention sweeps and orphan reconciliation

#![warn(missing_docs)]
#![warn(rustdoc::missing_crate_level_docs)]

use std::time::Duration;
use thiserror::Error;

use artifact::ArtifactError;
use driver::DriverError;
use integrity::Checksum;
use ledger::LedgerError;
use types::{RecordId, StoreKind};

/// Result type for tristore operations
pub type Result<T> = std::result::Result<T, BackupError>;

/// Main error type for backup and restore runs
///
/// Variants keep "nothing to restore", "corruption detected" and "store
/// unreachable" apart; callers react to each differently.
#[derive(Error, Debug)]
pub enum BackupError {
    /// The source store was unreachable or returned an inconsistent snapshot
    #[error("Capture of {kind} failed: {source}")]
    Capture {
        /// Store being captured
        kind: StoreKind,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// Artifact transport failure while uploading
    #[error("Upload failed: {0}")]
    Upload(#[source] ArtifactError),

    /// The artifact bytes do not hash to the recorded checksum
    #[error("Checksum mismatch for {key}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// Artifact key
        key: String,
        /// Checksum recorded in the ledger
        expected: Checksum,
        /// Checksum of the bytes read back
        actual: Checksum,
    },

    /// Another backup of the same kind is in flight
    #[error("A backup of {0} is already in flight")]
    Conflict(StoreKind),

    /// No succeeded backup exists for the kind yet
    #[error("No succeeded backups of {0}")]
    NoBackups(StoreKind),

    /// The selected record does not exist or is not a succeeded backup of the kind
    #[error("Backup record not found: {0}")]
    RecordNotFound(RecordId),

    /// The ledger points at an artifact that storage no longer has
    #[error("Artifact {key} of record {record} is missing from storage")]
    ArtifactMissing {
        /// Record pointing at the artifact
        record: RecordId,
        /// Missing key
        key: String,
    },

    /// Artifact transport failure while downloading
    #[error("Download failed: {0}")]
    Download(#[source] ArtifactError),

    /// The artifact hashes correctly but cannot be read back
    #[error("Artifact {key} is corrupt: {detail}")]
    CorruptArtifact {
        /// Artifact key
        key: String,
        /// Decoder complaint
        detail: String,
    },

    /// The target store rejected the restore
    #[error("Restore of {kind} failed: {source}")]
    Restore {
        /// Store being restored
        kind: StoreKind,
        /// Driver failure
        #[source]
        source: DriverError,
    },

    /// The run exceeded its configured time limit
    #[error("Run timed out after {0:?}")]
    Timeout(Duration),

    /// The ledger could not be read or written
    #[error("Ledger error: {0}")]
    Ledger(#[source] LedgerError),

    /// No driver is registered for the kind
    #[error("No driver registered for {0}")]
    DriverMissing(StoreKind),
}

impl BackupError {
    /// True for "no backups", "no such record" and "artifact missing"
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            BackupError::NoBackups(_) | BackupError::RecordNotFound(_) | BackupError::ArtifactMissing { .. }
        )
    }

    /// Stable label for logs, metrics and CLI output
    pub fn category(&self) -> &'static str {
        match self {
            BackupError::Capture { .. } => "capture",
            BackupError::Upload(_) => "upload",
            BackupError::ChecksumMismatch { .. } => "checksum_mismatch",
            BackupError::Conflict(_) => "conflict",
            BackupError::NoBackups(_) => "no_backups",
            BackupError::RecordNotFound(_) => "record_not_found",
            BackupError::ArtifactMissing { .. } => "artifact_missing",
            BackupError::Download(_) => "download",
            BackupError::CorruptArtifact { .. } => "corrupt_artifact",
            BackupError::Restore { .. } => "restore",
            BackupError::Timeout(_) => "timeout",
            BackupError::Ledger(_) => "ledger",
            BackupError::DriverMissing(_) => "driver_missing",
        }
    }

    /// Map a ledger error, keeping mutual-exclusion conflicts distinct
    pub fn from_ledger(error: LedgerError) -> Self {
        match error {
            LedgerError::Conflict(kind) => BackupError::Conflict(kind),
            other => BackupError::Ledger(other),
        }
    }
}

/// Artifact format and blob stores
pub mod artifact;

/// Configuration file and environment overrides
pub mod config;

/// Capture and restore per store kind
pub mod driver;

/// Checksums, streaming tee and store fingerprints
pub mod integrity;

/// Backup ledger
pub mod ledger;

/// Prometheus metrics
pub mod metrics;

/// Backup and restore state machines
pub mod orchestrator;

/// Retention sweeps
pub mod retention;

/// Facade wiring ledger, storage and drivers together
pub mod service;

/// Core data model
pub mod types;

pub use orchestrator::{BackupOutcome, RestoreMode, RestoreOutcome, RestoreRequest};
pub use retention::SweepReport;
pub use service::Tristore;
pub use types::{BackupRecord, BackupStatus, RestoreSelector, RetentionPolicies, RetentionPolicy};
