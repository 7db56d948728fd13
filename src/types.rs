// Backup System Types - store kinds, ledger records, selectors and retention

use crate::integrity::Checksum;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Backend category backed up independently of the others
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    /// Vector index (collections of points with payloads)
    Vector,
    /// Graph database (nodes and typed relationships)
    Graph,
    /// Relational database (tables and rows)
    Relational,
}

impl StoreKind {
    /// Every store kind, in a stable order
    pub const ALL: [StoreKind; 3] = [StoreKind::Vector, StoreKind::Graph, StoreKind::Relational];

    /// Stable lowercase name, used in storage keys and the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreKind::Vector => "vector",
            StoreKind::Graph => "graph",
            StoreKind::Relational => "relational",
        }
    }
}

impl fmt::Display for StoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string names no known kind or status
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value}")]
pub struct ParseEnumError {
    what: &'static str,
    value: String,
}

impl FromStr for StoreKind {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "vector" => Ok(StoreKind::Vector),
            "graph" => Ok(StoreKind::Graph),
            "relational" => Ok(StoreKind::Relational),
            other => Err(ParseEnumError {
                what: "store kind",
                value: other.to_string(),
            }),
        }
    }
}

/// Lifecycle status of a backup attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackupStatus {
    /// Accepted, not yet capturing
    Pending,
    /// Capture and upload in progress
    Running,
    /// Artifact stored and recorded
    Succeeded,
    /// Aborted; see `error_detail`
    Failed,
}

impl BackupStatus {
    /// Lowercase name as stored in the ledger
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupStatus::Pending => "pending",
            BackupStatus::Running => "running",
            BackupStatus::Succeeded => "succeeded",
            BackupStatus::Failed => "failed",
        }
    }

    /// Terminal records are never mutated again
    pub fn is_terminal(&self) -> bool {
        matches!(self, BackupStatus::Succeeded | BackupStatus::Failed)
    }

    /// In-flight records hold the per-kind mutual exclusion
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(BackupStatus::Pending),
            "running" => Ok(BackupStatus::Running),
            "succeeded" => Ok(BackupStatus::Succeeded),
            "failed" => Ok(BackupStatus::Failed),
            other => Err(ParseEnumError {
                what: "backup status",
                value: other.to_string(),
            }),
        }
    }
}

/// Opaque unique identifier of a backup record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(Uuid);

impl RecordId {
    /// Generate a fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The underlying UUID
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for RecordId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for RecordId {
    fn from(uuid: Uuid) -> Self {
        Self(uuid)
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RecordId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// A ledger record violates the data model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("record {id} violates invariant: {reason}")]
pub struct InvariantViolation {
    /// Offending record
    pub id: RecordId,
    /// Which rule was broken
    pub reason: String,
}

/// One backup attempt. Metadata only, never the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Unique record identifier
    pub id: RecordId,
    /// Store the backup was taken from
    pub store_kind: StoreKind,
    /// When the run was accepted
    pub started_at: DateTime<Utc>,
    /// When the run reached a terminal status
    pub completed_at: Option<DateTime<Utc>>,
    /// Lifecycle status
    pub status: BackupStatus,
    /// Artifact size, set on success
    pub size_bytes: Option<u64>,
    /// SHA-256 of the stored artifact, set on success
    pub checksum: Option<Checksum>,
    /// Artifact location, set on success
    pub storage_key: Option<String>,
    /// Failure reason, set on failure
    pub error_detail: Option<String>,
}

impl BackupRecord {
    /// A freshly accepted request
    pub fn pending(store_kind: StoreKind, started_at: DateTime<Utc>) -> Self {
        Self {
            id: RecordId::new(),
            store_kind,
            started_at,
            completed_at: None,
            status: BackupStatus::Pending,
            size_bytes: None,
            checksum: None,
            storage_key: None,
            error_detail: None,
        }
    }

    /// `completed_at - started_at`, absent while in flight
    pub fn duration(&self) -> Option<chrono::Duration> {
        self.completed_at.map(|done| done - self.started_at)
    }

    /// Succeeded or failed
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply a successful completion to an in-flight record
    pub fn succeed(&mut self, completion: Completion, at: DateTime<Utc>) {
        self.status = BackupStatus::Succeeded;
        self.completed_at = Some(at);
        self.size_bytes = Some(completion.size_bytes);
        self.checksum = Some(completion.checksum);
        self.storage_key = Some(completion.storage_key);
        self.error_detail = None;
    }

    /// Apply a failure to an in-flight record
    pub fn fail(&mut self, detail: impl Into<String>, at: DateTime<Utc>) {
        self.status = BackupStatus::Failed;
        self.completed_at = Some(at);
        self.size_bytes = None;
        self.checksum = None;
        self.storage_key = None;
        self.error_detail = Some(detail.into());
    }

    /// Check status-dependent field population
    pub fn validate(&self) -> Result<(), InvariantViolation> {
        let violation = |reason: &str| InvariantViolation {
            id: self.id,
            reason: reason.to_string(),
        };

        if self.checksum.is_some() != self.storage_key.is_some() {
            return Err(violation("checksum and storage_key must be set together"));
        }

        match self.status {
            BackupStatus::Pending | BackupStatus::Running => {
                if self.completed_at.is_some() {
                    return Err(violation("in-flight record has completed_at"));
                }
                if self.checksum.is_some() || self.error_detail.is_some() {
                    return Err(violation("in-flight record carries a result"));
                }
            }
            BackupStatus::Succeeded => {
                if self.checksum.is_none() || self.size_bytes.is_none() {
                    return Err(violation("succeeded record without checksum or size"));
                }
                if self.completed_at.is_none() {
                    return Err(violation("succeeded record without completed_at"));
                }
            }
            BackupStatus::Failed => {
                if self.error_detail.is_none() {
                    return Err(violation("failed record without error_detail"));
                }
                if self.checksum.is_some() {
                    return Err(violation("failed record carries a checksum"));
                }
            }
        }

        Ok(())
    }
}

/// Result fields written by `complete`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    /// Bytes acknowledged by the artifact store
    pub size_bytes: u64,
    /// Digest of exactly those bytes
    pub checksum: Checksum,
    /// Where the artifact was written
    pub storage_key: String,
}

/// Picks exactly one succeeded record for restore
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreSelector {
    /// Newest succeeded record of the kind
    Latest(StoreKind),
    /// A specific record, which must be a succeeded record of the kind
    Explicit {
        /// Store kind the record must belong to
        kind: StoreKind,
        /// Record to restore
        id: RecordId,
    },
}

impl RestoreSelector {
    /// Store kind the selector applies to
    pub fn kind(&self) -> StoreKind {
        match self {
            RestoreSelector::Latest(kind) => *kind,
            RestoreSelector::Explicit { kind, .. } => *kind,
        }
    }
}

impl fmt::Display for RestoreSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreSelector::Latest(kind) => write!(f, "{}:latest", kind),
            RestoreSelector::Explicit { kind, id } => write!(f, "{}:{}", kind, id),
        }
    }
}

/// Per-kind retention: delete only what is older than `max_age`
/// while `min_retained_count` newer successes remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetentionPolicy {
    /// Age beyond which a success becomes eligible for deletion
    pub max_age_secs: u64,
    /// Newest successes always kept regardless of age
    pub min_retained_count: usize,
}

impl RetentionPolicy {
    /// Thirty days, keeping at least three
    pub fn new() -> Self {
        Self {
            max_age_secs: 30 * 24 * 3600, // 30 days
            min_retained_count: 3,
        }
    }

    /// Set the age threshold
    pub fn max_age(mut self, max_age: Duration) -> Self {
        self.max_age_secs = max_age.as_secs();
        self
    }

    /// Set the number of successes always kept
    pub fn min_retained_count(mut self, count: usize) -> Self {
        self.min_retained_count = count;
        self
    }

    /// `max_age_secs` as a chrono duration
    pub fn max_age_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.max_age_secs.min(MAX_DURATION_SECS) as i64)
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Retention settings for every kind plus the in-flight grace window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicies {
    /// Policy for kinds without an override
    pub default: RetentionPolicy,
    /// Per-kind policies
    pub overrides: BTreeMap<StoreKind, RetentionPolicy>,
    /// Records newer than this are never swept
    pub grace_window_secs: u64,
}

impl RetentionPolicies {
    /// The same policy for every kind, no grace window
    pub fn uniform(policy: RetentionPolicy) -> Self {
        Self {
            default: policy,
            overrides: BTreeMap::new(),
            grace_window_secs: 0,
        }
    }

    /// Override the policy for one kind
    pub fn with_override(mut self, kind: StoreKind, policy: RetentionPolicy) -> Self {
        self.overrides.insert(kind, policy);
        self
    }

    /// Set the in-flight grace window
    pub fn grace_window(mut self, window: Duration) -> Self {
        self.grace_window_secs = window.as_secs();
        self
    }

    /// Effective policy for `kind`
    pub fn for_kind(&self, kind: StoreKind) -> &RetentionPolicy {
        self.overrides.get(&kind).unwrap_or(&self.default)
    }

    /// `grace_window_secs` as a chrono duration
    pub fn grace_window_duration(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_window_secs.min(MAX_DURATION_SECS) as i64)
    }
}

impl Default for RetentionPolicies {
    fn default() -> Self {
        Self {
            default: RetentionPolicy::new(),
            overrides: BTreeMap::new(),
            grace_window_secs: 6 * 3600, // covers the longest plausible run
        }
    }
}

/// Largest second count chrono accepts
const MAX_DURATION_SECS: u64 = i64::MAX as u64 / 1000;

const KEY_TIMESTAMP_FORMAT: &str = "%Y%m%dT%H%M%S%3fZ";

/// Object key `{store_kind}/{timestamp}-{id}.{ext}`, sortable by time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageKey {
    /// Store kind prefix
    pub store_kind: StoreKind,
    /// Start time of the run
    pub timestamp: DateTime<Utc>,
    /// Record the artifact belongs to
    pub id: RecordId,
    /// File extension without the leading dot
    pub extension: String,
}

impl StorageKey {
    /// Build a key; a leading dot on `extension` is dropped
    pub fn new(store_kind: StoreKind, timestamp: DateTime<Utc>, id: RecordId, extension: &str) -> Self {
        Self {
            store_kind,
            timestamp,
            id,
            extension: extension.trim_start_matches('.').to_string(),
        }
    }

    /// Prefix under which every artifact of a kind lives
    pub fn prefix(kind: StoreKind) -> String {
        format!("{}/", kind.as_str())
    }

    /// Parse a key produced by `to_string`; foreign keys yield `None`
    pub fn parse(key: &str) -> Option<Self> {
        let (kind, rest) = key.split_once('/')?;
        let store_kind = kind.parse().ok()?;
        let (stamp, rest) = rest.split_once('-')?;
        let naive = NaiveDateTime::parse_from_str(stamp, KEY_TIMESTAMP_FORMAT).ok()?;
        // A hyphenated UUID is 36 characters
        let id = rest.get(..36)?.parse().ok()?;
        let extension = rest.get(36..)?.strip_prefix('.')?;

        Some(Self {
            store_kind,
            timestamp: Utc.from_utc_datetime(&naive),
            id,
            extension: extension.to_string(),
        })
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}-{}.{}",
            self.store_kind,
            self.timestamp.format(KEY_TIMESTAMP_FORMAT),
            self.id,
            self.extension
        )
    }
}
