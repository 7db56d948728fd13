//! Artifact storage: a keyed blob repository for captured snapshots
//!
//! Backends never expose a partially written object. `put` consumes the
//! whole byte stream before the key becomes visible to `get`, `exists`
//! and `list`, whatever the transport underneath.

/// Filesystem artifact store
pub mod file;
pub mod format;
/// In-memory artifact store
pub mod memory;
/// S3 artifact store
#[cfg(feature = "s3")]
pub mod s3;

pub use file::FileArtifactStore;
pub use format::{ArtifactHeader, ArtifactReader, ArtifactTrailer, ArtifactWriter, Compression};
pub use memory::MemoryArtifactStore;
#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Byte stream handed to [`ArtifactStore::put`]
pub type ByteStream = BoxStream<'static, Result<Bytes, ArtifactError>>;

/// Artifact storage errors
#[derive(Error, Debug)]
pub enum ArtifactError {
    /// The key does not exist
    #[error("Artifact not found: {0}")]
    NotFound(String),

    /// The key is not acceptable to this backend
    #[error("Invalid artifact key {key:?}: {reason}")]
    InvalidKey { key: String, reason: String },

    /// The producer of the uploaded stream failed
    #[error("Artifact source interrupted: {0}")]
    SourceInterrupted(String),

    /// Transport or backend failure
    #[error("Artifact storage error: {0}")]
    Storage(String),

    /// Local filesystem failure
    #[error("Artifact IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArtifactError {
    /// The key does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, ArtifactError::NotFound(_))
    }
}

/// S3 artifact store configuration, usable without the `s3` feature
/// so configuration files parse either way
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3ArtifactConfig {
    /// Target bucket
    pub bucket_name: String,
    /// AWS region
    pub region: String,
    /// Prepended to every key
    pub key_prefix: String,
    /// Request server-side AES-256 encryption
    pub enable_encryption: bool,
    /// Custom endpoint for S3-compatible services
    pub endpoint_url: Option<String>,
    /// Use path-style addressing
    pub force_path_style: bool,
}

impl Default for S3ArtifactConfig {
    fn default() -> Self {
        Self {
            bucket_name: "tristore-artifacts".to_string(),
            region: "us-east-1".to_string(),
            key_prefix: String::new(),
            enable_encryption: true,
            endpoint_url: None,
            force_path_style: false,
        }
    }
}

/// Keyed blob repository
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Short backend label for logs
    fn backend_name(&self) -> &'static str;

    /// Store the whole stream under `key`, replacing any previous object.
    /// Returns the number of bytes written.
    async fn put(&self, key: &str, stream: ByteStream) -> Result<u64, ArtifactError>;

    /// Fetch a complete object
    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError>;

    /// Whether `key` is stored
    async fn exists(&self, key: &str) -> Result<bool, ArtifactError>;

    /// Object size in bytes
    async fn size(&self, key: &str) -> Result<u64, ArtifactError>;

    /// Remove an object; removing a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), ArtifactError>;

    /// Keys starting with `prefix`, sorted ascending
    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError>;
}

/// Reject keys that could escape a storage root or alias other keys
pub(crate) fn check_key(key: &str) -> Result<(), ArtifactError> {
    let invalid = |reason: &str| ArtifactError::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("empty key"));
    }
    if key.starts_with('/') || key.starts_with('\\') {
        return Err(invalid("absolute keys are not allowed"));
    }
    if key.split('/').any(|part| part.is_empty() || part == "." || part == "..") {
        return Err(invalid("empty, '.' or '..' path components are not allowed"));
    }
    if key.contains('\\') || key.contains('\0') {
        return Err(invalid("backslash or NUL in key"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_key() {
        assert!(check_key("graph/20260101T000000000Z-x.jsonl.gz").is_ok());
        assert!(check_key("").is_err());
        assert!(check_key("/etc/passwd").is_err());
        assert!(check_key("graph/../secrets").is_err());
        assert!(check_key("graph//x").is_err());
    }
}
