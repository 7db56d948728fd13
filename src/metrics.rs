//! Metrics collection for backup, restore and retention runs
//!
//! Provides Prometheus-compatible counters and histograms registered in the
//! default registry. Rendering is left to the caller via [`gather`].

use crate::types::StoreKind;
use lazy_static::lazy_static;
use prometheus::{register_histogram_vec, register_int_counter_vec, Encoder, HistogramVec, IntCounterVec, TextEncoder};
use std::time::Instant;

lazy_static! {
    /// Counter for backup runs by outcome
    static ref BACKUP_RUNS: IntCounterVec = register_int_counter_vec!(
        "tristore_backup_runs_total",
        "Total number of backup runs",
        &["store_kind", "status"]
    ).unwrap();

    /// Counter for restore runs by mode and outcome
    static ref RESTORE_RUNS: IntCounterVec = register_int_counter_vec!(
        "tristore_restore_runs_total",
        "Total number of restore runs",
        &["store_kind", "mode", "status"]
    ).unwrap();

    /// Histogram for run duration
    static ref RUN_DURATION: HistogramVec = register_histogram_vec!(
        "tristore_run_duration_seconds",
        "Backup and restore run duration in seconds",
        &["operation", "store_kind"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0]
    ).unwrap();

    /// Counter for artifact bytes uploaded
    static ref ARTIFACT_BYTES: IntCounterVec = register_int_counter_vec!(
        "tristore_artifact_bytes_total",
        "Total artifact bytes written to storage",
        &["store_kind"]
    ).unwrap();

    /// Counter for records removed by retention
    static ref RETENTION_DELETIONS: IntCounterVec = register_int_counter_vec!(
        "tristore_retention_deletions_total",
        "Total number of backups deleted by retention sweeps",
        &["store_kind"]
    ).unwrap();
}

/// Record a finished backup run
pub fn record_backup(kind: StoreKind, status: &str, duration_secs: f64) {
    BACKUP_RUNS.with_label_values(&[kind.as_str(), status]).inc();
    RUN_DURATION
        .with_label_values(&["backup", kind.as_str()])
        .observe(duration_secs);
}

/// Record a finished restore run
pub fn record_restore(kind: StoreKind, mode: &str, status: &str, duration_secs: f64) {
    RESTORE_RUNS.with_label_values(&[kind.as_str(), mode, status]).inc();
    RUN_DURATION
        .with_label_values(&["restore", kind.as_str()])
        .observe(duration_secs);
}

/// Count stored artifact bytes for `kind`
pub fn record_artifact_bytes(kind: StoreKind, bytes: u64) {
    ARTIFACT_BYTES.with_label_values(&[kind.as_str()]).inc_by(bytes);
}

/// Count one retention deletion for `kind`
pub fn record_retention_deletion(kind: StoreKind) {
    RETENTION_DELETIONS.with_label_values(&[kind.as_str()]).inc();
}

/// Render every registered metric in the Prometheus text format
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Timer for measuring operation duration
pub struct Timer {
    start: Instant,
}

impl Timer {
    /// Start a new timer
    #[inline]
    pub fn start() -> Self {
        Self { start: Instant::now() }
    }

    /// Get elapsed time in seconds
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}
