//! Backup ledger: durable metadata for every backup attempt
//!
//! The ledger is the single serialization point per store kind. `begin`
//! checks for an in-flight record and inserts the new one as one atomic
//! step, so two runs of the same kind can never both proceed, even across
//! independent orchestrator processes when the ledger is shared.

/// Process-local ledger
pub mod memory;
pub mod postgres;

pub use memory::MemoryLedger;
pub use postgres::{PostgresLedger, PostgresLedgerConfig};

use crate::types::{BackupRecord, BackupStatus, Completion, InvariantViolation, RecordId, StoreKind};
use async_trait::async_trait;
use thiserror::Error;

/// Errors related to the ledger
#[derive(Error, Debug)]
pub enum LedgerError {
    /// A pending or running record already exists for the kind
    #[error("A backup of {0} is already in flight")]
    Conflict(StoreKind),

    /// No record with this id
    #[error("Backup record not found: {0}")]
    NotFound(RecordId),

    /// Only terminal records may be removed
    #[error("Backup record {0} is still in flight")]
    NotTerminal(RecordId),

    /// The record finished (or was abandoned) before the transition
    #[error("Backup record {0} is already terminal")]
    Terminal(RecordId),

    /// A stored record violates the data model
    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    /// The backing storage failed
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

/// Filter for [`BackupLedger::query`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerQuery {
    /// Only this kind
    pub store_kind: Option<StoreKind>,
    /// Only this status
    pub status: Option<BackupStatus>,
    /// At most this many records
    pub limit: Option<usize>,
    /// Order by `started_at` descending
    pub newest_first: bool,
}

impl Default for LedgerQuery {
    fn default() -> Self {
        Self {
            store_kind: None,
            status: None,
            limit: None,
            newest_first: true,
        }
    }
}

impl LedgerQuery {
    /// Every record, newest first
    pub fn all() -> Self {
        Self::default()
    }

    /// Restrict to one kind
    pub fn kind(mut self, kind: StoreKind) -> Self {
        self.store_kind = Some(kind);
        self
    }

    /// Restrict to one status
    pub fn status(mut self, status: BackupStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Cap the number of results
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Order by `started_at` ascending
    pub fn oldest_first(mut self) -> Self {
        self.newest_first = false;
        self
    }

    /// Record passes the kind and status filters
    pub fn matches(&self, record: &BackupRecord) -> bool {
        self.store_kind.map_or(true, |k| record.store_kind == k) && self.status.map_or(true, |s| record.status == s)
    }

    /// Filter, order by `started_at` then `id`, and truncate
    pub fn apply(&self, records: impl IntoIterator<Item = BackupRecord>) -> Vec<BackupRecord> {
        let mut selected: Vec<BackupRecord> = records.into_iter().filter(|r| self.matches(r)).collect();
        selected.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        if self.newest_first {
            selected.reverse();
        }
        if let Some(limit) = self.limit {
            selected.truncate(limit);
        }
        selected
    }
}

/// The record `Latest` resolves to: greatest `completed_at` among succeeded
/// records, ties broken by the greater id
pub fn select_latest<'a>(records: impl IntoIterator<Item = &'a BackupRecord>) -> Option<&'a BackupRecord> {
    records
        .into_iter()
        .filter(|r| r.status == BackupStatus::Succeeded)
        .filter_map(|r| r.completed_at.map(|at| (at, r.id, r)))
        .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)))
        .map(|(_, _, record)| record)
}

/// Durable record of backup attempts
#[async_trait]
pub trait BackupLedger: Send + Sync {
    /// Insert a pending record, or fail with `Conflict` if one of the same
    /// kind is pending or running. Check and insert are one atomic step.
    async fn begin(&self, kind: StoreKind) -> Result<BackupRecord, LedgerError>;

    /// Pending to running; a running record is left as is
    async fn mark_running(&self, id: RecordId) -> Result<BackupRecord, LedgerError>;

    /// Record success. A no-op returning the stored record if already terminal.
    async fn complete(&self, id: RecordId, completion: Completion) -> Result<BackupRecord, LedgerError>;

    /// Record failure. A no-op returning the stored record if already terminal.
    async fn fail(&self, id: RecordId, detail: &str) -> Result<BackupRecord, LedgerError>;

    /// Records matching `query`
    async fn query(&self, query: &LedgerQuery) -> Result<Vec<BackupRecord>, LedgerError>;

    /// One record by id
    async fn get(&self, id: RecordId) -> Result<Option<BackupRecord>, LedgerError>;

    /// Delete a terminal record
    async fn remove(&self, id: RecordId) -> Result<(), LedgerError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity::Checksum;
    use chrono::{Duration, TimeZone, Utc};

    fn succeeded(kind: StoreKind, minute: u32) -> BackupRecord {
        let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, minute, 0).unwrap();
        let mut record = BackupRecord::pending(kind, start);
        record.succeed(
            Completion {
                size_bytes: 1,
                checksum: Checksum::of(b"x"),
                storage_key: format!("{}/k{}", kind, minute),
            },
            start + Duration::seconds(30),
        );
        record
    }

    #[test]
    fn test_select_latest_prefers_newest_completion() {
        let older = succeeded(StoreKind::Graph, 1);
        let newer = succeeded(StoreKind::Graph, 5);
        let mut running = BackupRecord::pending(StoreKind::Graph, Utc::now());
        running.status = BackupStatus::Running;

        let records = vec![newer.clone(), running, older];
        assert_eq!(select_latest(&records).map(|r| r.id), Some(newer.id));
    }

    #[test]
    fn test_select_latest_breaks_ties_by_id() {
        let a = succeeded(StoreKind::Vector, 3);
        let mut b = succeeded(StoreKind::Vector, 3);
        b.completed_at = a.completed_at;

        let expected = a.id.max(b.id);
        assert_eq!(select_latest(&[a.clone(), b.clone()]).map(|r| r.id), Some(expected));
        assert_eq!(select_latest(&[b, a]).map(|r| r.id), Some(expected));
    }

    #[test]
    fn test_select_latest_ignores_failures() {
        let mut failed = succeeded(StoreKind::Relational, 9);
        failed.fail("boom", Utc::now());
        assert!(select_latest(&[failed]).is_none());
    }

    #[test]
    fn test_query_orders_and_limits() {
        let records = vec![
            succeeded(StoreKind::Graph, 1),
            succeeded(StoreKind::Vector, 2),
            succeeded(StoreKind::Graph, 3),
            succeeded(StoreKind::Graph, 4),
        ];

        let newest = LedgerQuery::all().kind(StoreKind::Graph).limit(2).apply(records.clone());
        assert_eq!(newest.len(), 2);
        assert_eq!(newest[0].id, records[3].id);
        assert_eq!(newest[1].id, records[2].id);

        let oldest = LedgerQuery::all().oldest_first().apply(records.clone());
        assert_eq!(oldest.first().map(|r| r.id), Some(records[0].id));
    }
}
