//! Integrity primitives: artifact checksums, store fingerprints and the
//! validator that compares them against what the ledger expects.

use crate::artifact::{ArtifactError, ArtifactStore, ByteStream};
use crate::driver::{ArtifactStream, DriverError, StoreDriver};
use crate::types::StoreKind;
use bytes::Bytes;
use futures::stream::{Stream, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

const VERIFY_CHUNK_BYTES: usize = 64 * 1024;

/// Lowercase hex SHA-256 of an artifact payload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Checksum(String);

/// The string is not a 256-bit hex digest
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid checksum {0:?}: expected 64 hex characters")]
pub struct InvalidChecksum(String);

impl Checksum {
    /// Digest a complete payload
    pub fn of(payload: &[u8]) -> Self {
        let mut accumulator = ChecksumAccumulator::new();
        accumulator.update(payload);
        accumulator.finalize().0
    }

    /// Parse a 64-character hex digest
    pub fn parse(hex: &str) -> Result<Self, InvalidChecksum> {
        let hex = hex.trim();
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Ok(Self(hex.to_ascii_lowercase()))
        } else {
            Err(InvalidChecksum(hex.to_string()))
        }
    }

    /// Lowercase hex form
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Checksum {
    type Error = InvalidChecksum;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Checksum> for String {
    fn from(checksum: Checksum) -> Self {
        checksum.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Incremental digest over a payload seen chunk by chunk
#[derive(Clone, Default)]
pub struct ChecksumAccumulator {
    hasher: Sha256,
    bytes: u64,
}

impl ChecksumAccumulator {
    /// Empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk
    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Bytes fed so far
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Checksum and total byte count
    pub fn finalize(self) -> (Checksum, u64) {
        (Checksum(format!("{:x}", self.hasher.finalize())), self.bytes)
    }
}

#[derive(Default)]
struct TeeState {
    accumulator: ChecksumAccumulator,
    source_error: Option<DriverError>,
}

/// Handle onto the digest computed while a capture stream is uploaded
#[derive(Clone)]
pub struct ChecksumTee {
    state: Arc<Mutex<TeeState>>,
}

impl ChecksumTee {
    /// Checksum and size of everything that passed through so far
    pub fn finish(&self) -> (Checksum, u64) {
        self.state.lock().accumulator.clone().finalize()
    }

    /// The capture-side error that interrupted the stream, if any
    pub fn take_source_error(&self) -> Option<DriverError> {
        self.state.lock().source_error.take()
    }
}

/// Forward a capture stream to an upload sink while digesting every chunk.
///
/// Driver failures are parked in the tee so the caller can tell a capture
/// failure apart from a transport failure once `put` returns.
pub fn checksum_tee(source: ArtifactStream) -> (ByteStream, ChecksumTee) {
    let tee = ChecksumTee {
        state: Arc::new(Mutex::new(TeeState::default())),
    };
    let state = Arc::clone(&tee.state);

    let stream = source
        .map(move |item| match item {
            Ok(chunk) => {
                state.lock().accumulator.update(&chunk);
                Ok(chunk)
            }
            Err(e) => {
                let detail = e.to_string();
                state.lock().source_error = Some(e);
                Err(ArtifactError::SourceInterrupted(detail))
            }
        })
        .boxed();

    (stream, tee)
}

/// Order-independent summary of a store's content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    /// Number of entities (collections, points, nodes, rows, ...)
    pub entities: u64,
    /// Multiset digest of every entity
    pub digest: String,
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let short = self.digest.get(..16).unwrap_or(&self.digest);
        write!(f, "{} entities / {}", self.entities, short)
    }
}

/// Builds a [`Fingerprint`] as a lane-wise wrapping sum of per-entity
/// SHA-256 digests, so page order never changes the result.
#[derive(Debug, Clone, Default)]
pub struct FingerprintBuilder {
    entities: u64,
    lanes: [u64; 4],
}

impl FingerprintBuilder {
    /// Empty fingerprint
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one entity by its canonical encoding
    pub fn add(&mut self, canonical: &[u8]) {
        self.add_digest(&entity_digest(canonical));
    }

    /// Add one entity by a digest computed elsewhere
    pub fn add_digest(&mut self, digest: &[u8; 32]) {
        for (lane, bytes) in self.lanes.iter_mut().zip(digest.chunks_exact(8)) {
            let mut word = [0u8; 8];
            word.copy_from_slice(bytes);
            *lane = lane.wrapping_add(u64::from_le_bytes(word));
        }
        self.entities += 1;
    }

    /// Entities added so far
    pub fn entities(&self) -> u64 {
        self.entities
    }

    /// Digest of the multiset added so far
    pub fn finish(&self) -> Fingerprint {
        Fingerprint {
            entities: self.entities,
            digest: self.lanes.iter().map(|lane| format!("{:016x}", lane)).collect(),
        }
    }
}

/// SHA-256 of one entity's canonical bytes
pub fn entity_digest(canonical: &[u8]) -> [u8; 32] {
    Sha256::digest(canonical).into()
}

/// Outcome of comparing a payload against its recorded checksum
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    /// Checksum from the ledger
    pub expected: Checksum,
    /// Checksum of the bytes just read
    pub actual: Checksum,
    /// Bytes read
    pub size_bytes: u64,
}

impl Verification {
    /// Both checksums agree
    pub fn is_match(&self) -> bool {
        self.expected == self.actual
    }
}

/// Post-restore comparison of the live store against the artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreCheck {
    /// Store that was restored
    pub store_kind: StoreKind,
    /// Fingerprint carried by the artifact
    pub expected: Fingerprint,
    /// Fingerprint of the live store after restore
    pub observed: Fingerprint,
    /// `expected == observed`
    pub matches: bool,
}

/// Recomputes checksums and fingerprints independently of whoever wrote them
#[derive(Debug, Clone)]
pub struct IntegrityValidator {
    chunk_bytes: usize,
}

impl IntegrityValidator {
    /// Validator reading stored artifacts in 64 KiB chunks
    pub fn new() -> Self {
        Self {
            chunk_bytes: VERIFY_CHUNK_BYTES,
        }
    }

    /// Stream a payload through the digest without holding it in memory
    pub async fn verify<S>(&self, stream: S, expected: &Checksum) -> Result<Verification, ArtifactError>
    where
        S: Stream<Item = Result<Bytes, ArtifactError>>,
    {
        futures::pin_mut!(stream);
        let mut accumulator = ChecksumAccumulator::new();
        while let Some(chunk) = stream.next().await {
            accumulator.update(&chunk?);
        }
        Ok(self.conclude(accumulator, expected))
    }

    /// Verify an already downloaded payload, digesting it chunk by chunk
    pub fn verify_bytes(&self, payload: &[u8], expected: &Checksum) -> Verification {
        let mut accumulator = ChecksumAccumulator::new();
        for chunk in payload.chunks(self.chunk_bytes.max(1)) {
            accumulator.update(chunk);
        }
        self.conclude(accumulator, expected)
    }

    /// Download a stored artifact and verify it
    pub async fn verify_stored(
        &self,
        store: &dyn ArtifactStore,
        key: &str,
        expected: &Checksum,
    ) -> Result<Verification, ArtifactError> {
        let payload = store.get(key).await?;
        Ok(self.verify_bytes(&payload, expected))
    }

    /// Re-derive the live store fingerprint after a restore and compare it
    /// with the fingerprint captured at backup time. A mismatch is reported,
    /// never corrected here.
    pub async fn verify_restored(
        &self,
        driver: &dyn StoreDriver,
        expected: &Fingerprint,
    ) -> Result<RestoreCheck, DriverError> {
        let observed = driver.fingerprint().await?;
        let matches = &observed == expected;

        if matches {
            debug!(store_kind = %driver.kind(), fingerprint = %observed, "Restored store matches artifact");
        } else {
            warn!(
                store_kind = %driver.kind(),
                expected = %expected,
                observed = %observed,
                "Restored store fingerprint differs from artifact"
            );
        }

        Ok(RestoreCheck {
            store_kind: driver.kind(),
            expected: expected.clone(),
            observed,
            matches,
        })
    }

    fn conclude(&self, accumulator: ChecksumAccumulator, expected: &Checksum) -> Verification {
        let (actual, size_bytes) = accumulator.finalize();
        Verification {
            expected: expected.clone(),
            actual,
            size_bytes,
        }
    }
}

impl Default for IntegrityValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    #[test]
    fn test_checksum_matches_known_digest() {
        let checksum = Checksum::of(b"abc");
        assert_eq!(
            checksum.as_str(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(Checksum::parse(&checksum.as_str().to_uppercase()).unwrap(), checksum);
        assert!(Checksum::parse("abc").is_err());
    }

    #[test]
    fn test_fingerprint_ignores_order() {
        let mut forward = FingerprintBuilder::new();
        let mut backward = FingerprintBuilder::new();
        let entities = [b"alpha".as_slice(), b"beta", b"gamma"];

        for entity in entities {
            forward.add(entity);
        }
        for entity in entities.iter().rev() {
            backward.add(entity);
        }

        assert_eq!(forward.finish(), backward.finish());
        assert_eq!(forward.finish().entities, 3);
    }

    #[test]
    fn test_fingerprint_counts_duplicates() {
        let mut once = FingerprintBuilder::new();
        once.add(b"row");
        let mut twice = FingerprintBuilder::new();
        twice.add(b"row");
        twice.add(b"row");

        assert_ne!(once.finish().digest, twice.finish().digest);
    }

    #[tokio::test]
    async fn test_tee_digests_forwarded_chunks() {
        let source: ArtifactStream = stream::iter(vec![
            Ok(Bytes::from_static(b"ab")),
            Ok(Bytes::from_static(b"c")),
        ])
        .boxed();

        let (forwarded, tee) = checksum_tee(source);
        let chunks: Vec<_> = forwarded.collect().await;
        assert_eq!(chunks.len(), 2);

        let (checksum, size) = tee.finish();
        assert_eq!(checksum, Checksum::of(b"abc"));
        assert_eq!(size, 3);
        assert!(tee.take_source_error().is_none());
    }

    #[tokio::test]
    async fn test_tee_parks_driver_error() {
        let source: ArtifactStream = stream::iter(vec![
            Ok(Bytes::from_static(b"partial")),
            Err(DriverError::Unavailable("connection reset".to_string())),
        ])
        .boxed();

        let (forwarded, tee) = checksum_tee(source);
        let results: Vec<_> = forwarded.collect().await;
        assert!(matches!(results[1], Err(ArtifactError::SourceInterrupted(_))));
        assert!(matches!(tee.take_source_error(), Some(DriverError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_streaming_verify_detects_mismatch() {
        let validator = IntegrityValidator::new();
        let expected = Checksum::of(b"original");

        let good = validator
            .verify(stream::iter(vec![Ok(Bytes::from_static(b"origi")), Ok(Bytes::from_static(b"nal"))]), &expected)
            .await
            .unwrap();
        assert!(good.is_match());
        assert_eq!(good.size_bytes, 8);

        let bad = validator.verify_bytes(b"0riginal", &expected);
        assert!(!bad.is_match());
    }
}
