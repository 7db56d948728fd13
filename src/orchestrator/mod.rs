//! Backup and restore state machines
//!
//! Each run is an independent unit of work. Runs of different kinds share
//! nothing but the ledger and the artifact store; runs of the same kind are
//! serialized by [`BackupLedger::begin`](crate::ledger::BackupLedger::begin).
//! Nothing is retried inside a run.

/// Backup runs
pub mod backup;
/// Restore runs
pub mod restore;

pub use backup::{BackupOptions, BackupOrchestrator, BackupOutcome, BackupPhase};
pub use restore::{RestoreMode, RestoreOrchestrator, RestoreOutcome, RestorePhase, RestoreRequest};
