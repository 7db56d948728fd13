// File Artifact Storage - one file per key beneath a root directory

use super::{check_key, ArtifactError, ArtifactStore, ByteStream};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

const TEMP_PREFIX: &str = ".tmp-";

/// Removes a partially written file unless disarmed, including when the
/// writing future is dropped mid-stream
struct PartialFile {
    path: PathBuf,
    armed: bool,
}

impl PartialFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %e, "Failed to remove partial artifact file");
            }
        }
    }
}

/// Artifacts as files under a root directory, written via temporary sibling and rename
pub struct FileArtifactStore {
    root: PathBuf,
}

impl FileArtifactStore {
    /// Store rooted at `root`; directories are created on write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }

    fn temp_path(path: &Path) -> PathBuf {
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("artifact");
        path.with_file_name(format!("{}{}-{}", TEMP_PREFIX, Uuid::new_v4().simple(), name))
    }

    async fn write_stream(path: &Path, mut stream: ByteStream) -> Result<u64, ArtifactError> {
        let mut file = fs::File::create(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }

        file.sync_all().await?;
        Ok(written)
    }

    fn collect_keys<'a>(
        dir: PathBuf,
        relative: String,
        keys: &'a mut Vec<String>,
    ) -> futures::future::BoxFuture<'a, Result<(), ArtifactError>> {
        Box::pin(async move {
            let mut entries = match fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e.into()),
            };

            while let Some(entry) = entries.next_entry().await? {
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.starts_with(TEMP_PREFIX) {
                    continue;
                }
                let key = format!("{}{}", relative, name);
                if entry.file_type().await?.is_dir() {
                    Self::collect_keys(entry.path(), format!("{}/", key), keys).await?;
                } else {
                    keys.push(key);
                }
            }
            Ok(())
        })
    }
}

#[async_trait]
impl ArtifactStore for FileArtifactStore {
    fn backend_name(&self) -> &'static str {
        "file"
    }

    async fn put(&self, key: &str, stream: ByteStream) -> Result<u64, ArtifactError> {
        let path = self.object_path(key)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // Write a hidden sibling, then rename: readers never see a partial file
        let temp = PartialFile::new(Self::temp_path(&path));
        let written = Self::write_stream(&temp.path, stream).await?;
        fs::rename(&temp.path, &path).await?;
        temp.disarm();

        debug!(key = %key, bytes = written, "Stored artifact file");
        Ok(written)
    }

    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError> {
        let path = self.object_path(key)?;
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, ArtifactError> {
        let path = self.object_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    async fn size(&self, key: &str) -> Result<u64, ArtifactError> {
        let path = self.object_path(key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(ArtifactError::NotFound(key.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        let path = self.object_path(key)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let mut keys = Vec::new();
        Self::collect_keys(self.root.clone(), String::new(), &mut keys).await?;
        keys.retain(|key| key.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
