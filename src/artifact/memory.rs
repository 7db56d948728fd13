use super::{check_key, ArtifactError, ArtifactStore, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// In-memory artifact storage
#[derive(Clone, Default)]
pub struct MemoryArtifactStore {
    objects: Arc<dashmap::DashMap<String, Bytes>>,
    fail_puts: Arc<AtomicBool>,
}

impl MemoryArtifactStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail after draining its stream
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Overwrite an object in place, bypassing `put` (tests corrupt artifacts this way)
    pub fn tamper(&self, key: &str, f: impl FnOnce(&mut Vec<u8>)) -> bool {
        match self.objects.get_mut(key) {
            Some(mut object) => {
                let mut data = object.to_vec();
                f(&mut data);
                *object = Bytes::from(data);
                true
            }
            None => false,
        }
    }

    /// Number of stored objects
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// No objects stored
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn put(&self, key: &str, mut stream: ByteStream) -> Result<u64, ArtifactError> {
        check_key(key)?;

        let mut buffer = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
        }

        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(ArtifactError::Storage(format!("Injected put failure for {}", key)));
        }

        let size = buffer.len() as u64;
        // Visible only once the whole stream has been consumed
        self.objects.insert(key.to_string(), buffer.freeze());
        Ok(size)
    }

    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> Result<bool, ArtifactError> {
        Ok(self.objects.contains_key(key))
    }

    async fn size(&self, key: &str) -> Result<u64, ArtifactError> {
        self.objects
            .get(key)
            .map(|entry| entry.value().len() as u64)
            .ok_or_else(|| ArtifactError::NotFound(key.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.objects.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .filter(|entry| entry.key().starts_with(prefix))
            .map(|entry| entry.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
