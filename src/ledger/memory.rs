use super::{BackupLedger, LedgerError, LedgerQuery};
use crate::types::{BackupRecord, BackupStatus, Completion, RecordId, StoreKind};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// In-process ledger
///
/// `active` holds the in-flight record per kind; its entry lock makes the
/// check-and-insert in `begin` atomic.
#[derive(Clone, Default)]
pub struct MemoryLedger {
    records: Arc<DashMap<RecordId, BackupRecord>>,
    active: Arc<DashMap<StoreKind, RecordId>>,
}

impl MemoryLedger {
    /// Empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records of any status
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// No records at all
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Apply a terminal transition, then release the kind
    fn finish(&self, id: RecordId, apply: impl FnOnce(&mut BackupRecord)) -> Result<BackupRecord, LedgerError> {
        let (record, released) = {
            let mut entry = self.records.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
            if entry.is_terminal() {
                return Ok(entry.clone());
            }
            let mut updated = entry.clone();
            apply(&mut updated);
            updated.validate()?;
            *entry = updated.clone();
            (updated, entry.store_kind)
        };
        // The records guard is dropped before touching `active`; `begin`
        // takes the locks in the opposite order.
        self.active.remove_if(&released, |_, running| *running == id);
        Ok(record)
    }
}

#[async_trait]
impl BackupLedger for MemoryLedger {
    async fn begin(&self, kind: StoreKind) -> Result<BackupRecord, LedgerError> {
        match self.active.entry(kind) {
            Entry::Occupied(running) => {
                debug!(store_kind = %kind, running = %running.get(), "Rejected overlapping backup");
                Err(LedgerError::Conflict(kind))
            }
            Entry::Vacant(slot) => {
                let record = BackupRecord::pending(kind, Utc::now());
                self.records.insert(record.id, record.clone());
                slot.insert(record.id);
                Ok(record)
            }
        }
    }

    async fn mark_running(&self, id: RecordId) -> Result<BackupRecord, LedgerError> {
        let mut entry = self.records.get_mut(&id).ok_or(LedgerError::NotFound(id))?;
        match entry.status {
            BackupStatus::Pending => entry.status = BackupStatus::Running,
            BackupStatus::Running => {}
            BackupStatus::Succeeded | BackupStatus::Failed => return Err(LedgerError::Terminal(id)),
        }
        Ok(entry.clone())
    }

    async fn complete(&self, id: RecordId, completion: Completion) -> Result<BackupRecord, LedgerError> {
        self.finish(id, |record| record.succeed(completion, Utc::now()))
    }

    async fn fail(&self, id: RecordId, detail: &str) -> Result<BackupRecord, LedgerError> {
        self.finish(id, |record| record.fail(detail, Utc::now()))
    }

    async fn query(&self, query: &LedgerQuery) -> Result<Vec<BackupRecord>, LedgerError> {
        let snapshot: Vec<BackupRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        Ok(query.apply(snapshot))
    }

    async fn get(&self, id: RecordId) -> Result<Option<BackupRecord>, LedgerError> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn remove(&self, id: RecordId) -> Result<(), LedgerError> {
        match self.records.remove_if(&id, |_, record| record.is_terminal()) {
            Some(_) => Ok(()),
            None if self.records.contains_key(&id) => Err(LedgerError::NotTerminal(id)),
            None => Err(LedgerError::NotFound(id)),
        }
    }
}
