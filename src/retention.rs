//! Retention sweeps
//!
//! Planning is a pure function over ledger records; the sweeper executes a
//! plan by deleting each artifact before its ledger entry, so an interrupted
//! sweep leaves at worst a record whose blob is already gone, and the next
//! sweep finishes it because artifact deletion is idempotent.

use crate::artifact::ArtifactStore;
use crate::ledger::{BackupLedger, LedgerQuery};
use crate::metrics;
use crate::types::{BackupRecord, BackupStatus, RecordId, RetentionPolicies, StorageKey, StoreKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What a sweep would do, before touching anything
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepPlan {
    /// Records to delete, oldest first
    pub delete: Vec<BackupRecord>,
    /// Records kept
    pub retained: Vec<RecordId>,
    /// Past `max_age` but kept to honor `min_retained_count`
    pub skipped_below_minimum: Vec<RecordId>,
}

/// What a sweep did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Records whose artifact and ledger entry were removed
    pub deleted: Vec<RecordId>,
    /// Records kept
    pub retained: Vec<RecordId>,
    /// Past `max_age` but kept to honor `min_retained_count`
    pub skipped_below_minimum: Vec<RecordId>,
    /// Unreferenced artifact keys removed
    pub orphans_removed: Vec<String>,
    /// Per-item failures; the sweep continues past them
    pub errors: Vec<String>,
}

impl SweepReport {
    /// No errors were reported
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

fn age_reference(record: &BackupRecord) -> DateTime<Utc> {
    record.completed_at.unwrap_or(record.started_at)
}

/// Decide which records to delete.
///
/// Per kind, succeeded records newest first: the first `min_retained_count`
/// are kept whatever their age; of the rest, records started inside the
/// grace window are kept and records older than `max_age` are deleted.
/// Failed records past `max_age` and the grace window are deleted too.
/// In-flight records are never touched.
pub fn plan_sweep(records: &[BackupRecord], policies: &RetentionPolicies, now: DateTime<Utc>) -> SweepPlan {
    let grace = policies.grace_window_duration();
    let mut plan = SweepPlan::default();

    for kind in StoreKind::ALL {
        let policy = policies.for_kind(kind);
        let max_age = policy.max_age_duration();
        let expired = |record: &BackupRecord| now - age_reference(record) > max_age;
        let in_grace = |record: &BackupRecord| now - record.started_at < grace;

        let mut succeeded: Vec<&BackupRecord> = records
            .iter()
            .filter(|r| r.store_kind == kind && r.status == BackupStatus::Succeeded)
            .collect();
        succeeded.sort_by(|a, b| {
            age_reference(b)
                .cmp(&age_reference(a))
                .then_with(|| b.id.cmp(&a.id))
        });

        for (rank, record) in succeeded.into_iter().enumerate() {
            if rank < policy.min_retained_count {
                if expired(record) {
                    plan.skipped_below_minimum.push(record.id);
                } else {
                    plan.retained.push(record.id);
                }
            } else if in_grace(record) || !expired(record) {
                plan.retained.push(record.id);
            } else {
                plan.delete.push(record.clone());
            }
        }

        for record in records
            .iter()
            .filter(|r| r.store_kind == kind && r.status == BackupStatus::Failed)
        {
            if expired(record) && !in_grace(record) {
                plan.delete.push(record.clone());
            }
        }
    }

    plan
}

/// Applies retention policies to the ledger and artifact store
pub struct RetentionSweeper {
    ledger: Arc<dyn BackupLedger>,
    store: Arc<dyn ArtifactStore>,
    reconcile_orphans: bool,
}

impl RetentionSweeper {
    /// Sweeper over one ledger and artifact store
    pub fn new(ledger: Arc<dyn BackupLedger>, store: Arc<dyn ArtifactStore>) -> Self {
        Self {
            ledger,
            store,
            reconcile_orphans: true,
        }
    }

    /// Also remove unreferenced artifacts left by crashed runs (default on)
    pub fn reconcile_orphans(mut self, enabled: bool) -> Self {
        self.reconcile_orphans = enabled;
        self
    }

    /// Apply `policies` as of now
    pub async fn sweep(&self, policies: &RetentionPolicies) -> SweepReport {
        self.sweep_at(policies, Utc::now()).await
    }

    /// Sweep as if the current time were `now`
    pub async fn sweep_at(&self, policies: &RetentionPolicies, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        let records = match self.ledger.query(&LedgerQuery::all()).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Retention sweep could not read the ledger");
                report.errors.push(format!("ledger query failed: {}", e));
                return report;
            }
        };

        let plan = plan_sweep(&records, policies, now);
        report.retained = plan.retained;
        report.skipped_below_minimum = plan.skipped_below_minimum;

        for record in plan.delete {
            // Artifact first, then the ledger entry
            if let Some(key) = record.storage_key.as_deref() {
                if let Err(e) = self.store.delete(key).await {
                    warn!(record_id = %record.id, key = %key, error = %e, "Failed to delete artifact, keeping record");
                    report.errors.push(format!("delete artifact {}: {}", key, e));
                    continue;
                }
            }
            match self.ledger.remove(record.id).await {
                Ok(()) => {
                    info!(
                        store_kind = %record.store_kind,
                        record_id = %record.id,
                        status = %record.status,
                        "Retention deleted backup"
                    );
                    metrics::record_retention_deletion(record.store_kind);
                    report.deleted.push(record.id);
                }
                Err(e) => {
                    warn!(record_id = %record.id, error = %e, "Failed to remove ledger record");
                    report.errors.push(format!("remove record {}: {}", record.id, e));
                }
            }
        }

        if self.reconcile_orphans {
            self.remove_orphans(&records, policies, now, &mut report).await;
        }

        info!(
            deleted = report.deleted.len(),
            retained = report.retained.len(),
            skipped_below_minimum = report.skipped_below_minimum.len(),
            orphans_removed = report.orphans_removed.len(),
            errors = report.errors.len(),
            "Retention sweep finished"
        );
        report
    }

    /// Delete keys no record references, that no in-flight run owns, and
    /// whose key timestamp is older than the grace window
    async fn remove_orphans(
        &self,
        records: &[BackupRecord],
        policies: &RetentionPolicies,
        now: DateTime<Utc>,
        report: &mut SweepReport,
    ) {
        let referenced: HashSet<&str> = records.iter().filter_map(|r| r.storage_key.as_deref()).collect();
        let in_flight: HashSet<RecordId> = records.iter().filter(|r| r.status.is_active()).map(|r| r.id).collect();
        let grace = policies.grace_window_duration();

        for kind in StoreKind::ALL {
            let keys = match self.store.list(&StorageKey::prefix(kind)).await {
                Ok(keys) => keys,
                Err(e) => {
                    report.errors.push(format!("list {}: {}", kind, e));
                    continue;
                }
            };

            for key in keys {
                if referenced.contains(key.as_str()) {
                    continue;
                }
                let Some(parsed) = StorageKey::parse(&key) else {
                    debug!(key = %key, "Ignoring foreign key");
                    continue;
                };
                if in_flight.contains(&parsed.id) || now - parsed.timestamp < grace {
                    continue;
                }

                match self.store.delete(&key).await {
                    Ok(()) => {
                        info!(key = %key, "Removed orphaned artifact");
                        report.orphans_removed.push(key);
                    }
                    Err(e) => report.errors.push(format!("delete orphan {}: {}", key, e)),
                }
            }
        }
    }
}
