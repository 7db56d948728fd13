// S3 Artifact Storage - uses real S3 or an S3-compatible service (MinIO, LocalStack)

use super::{check_key, ArtifactError, ArtifactStore, ByteStream, S3ArtifactConfig};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream as S3Body;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, ServerSideEncryption};
use aws_sdk_s3::Client;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use tracing::{debug, warn};

/// Multipart part size; S3 requires at least 5 MiB for every part but the last
const PART_SIZE: usize = 8 * 1024 * 1024;

/// Artifacts in an S3 bucket, uploaded in multipart parts
pub struct S3ArtifactStore {
    client: Client,
    config: S3ArtifactConfig,
}

impl S3ArtifactStore {
    /// Build a client from the ambient AWS configuration
    pub async fn new(config: S3ArtifactConfig) -> Result<Self, ArtifactError> {
        if config.bucket_name.is_empty() {
            return Err(ArtifactError::Storage("S3 bucket name is empty".to_string()));
        }

        let mut aws_config_builder = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));

        // Support for LocalStack/MinIO with custom endpoint
        if let Some(ref endpoint) = config.endpoint_url {
            aws_config_builder = aws_config_builder.endpoint_url(endpoint);
        }

        let aws_config = aws_config_builder.load().await;
        let mut s3_config_builder = aws_sdk_s3::config::Builder::from(&aws_config);
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(s3_config_builder.build()),
            config,
        })
    }

    fn object_key(&self, key: &str) -> Result<String, ArtifactError> {
        check_key(key)?;
        Ok(format!("{}{}", self.config.key_prefix, key))
    }

    async fn put_single(&self, object_key: &str, body: Bytes) -> Result<(), ArtifactError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(object_key)
            .body(S3Body::from(body));

        if self.config.enable_encryption {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        request
            .send()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to put object {}: {}", object_key, e)))?;
        Ok(())
    }

    async fn upload_part(
        &self,
        object_key: &str,
        upload_id: &str,
        part_number: i32,
        body: Bytes,
    ) -> Result<CompletedPart, ArtifactError> {
        let response = self
            .client
            .upload_part()
            .bucket(&self.config.bucket_name)
            .key(object_key)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(S3Body::from(body))
            .send()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to upload part {}: {}", part_number, e)))?;

        Ok(CompletedPart::builder()
            .part_number(part_number)
            .e_tag(response.e_tag().unwrap_or_default())
            .build())
    }

    async fn start_multipart(&self, object_key: &str) -> Result<String, ArtifactError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(object_key);

        if self.config.enable_encryption {
            request = request.server_side_encryption(ServerSideEncryption::Aes256);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to create multipart upload: {}", e)))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| ArtifactError::Storage("No upload ID returned".to_string()))
    }

    /// Stream the remaining input as parts and complete the upload.
    /// The object does not exist until `complete_multipart_upload` succeeds.
    async fn finish_multipart(
        &self,
        object_key: &str,
        upload_id: &str,
        first_part: Bytes,
        mut stream: ByteStream,
    ) -> Result<u64, ArtifactError> {
        let mut parts = Vec::new();
        let mut written = first_part.len() as u64;
        parts.push(self.upload_part(object_key, upload_id, 1, first_part).await?);

        let mut buffer = BytesMut::with_capacity(PART_SIZE);
        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            if buffer.len() >= PART_SIZE {
                let body = buffer.split().freeze();
                written += body.len() as u64;
                let number = parts.len() as i32 + 1;
                parts.push(self.upload_part(object_key, upload_id, number, body).await?);
            }
        }

        if !buffer.is_empty() {
            let body = buffer.freeze();
            written += body.len() as u64;
            let number = parts.len() as i32 + 1;
            parts.push(self.upload_part(object_key, upload_id, number, body).await?);
        }

        let completed = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();
        self.client
            .complete_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(object_key)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to complete multipart upload: {}", e)))?;

        Ok(written)
    }

    async fn abort_multipart(&self, object_key: &str, upload_id: &str) {
        if let Err(e) = self
            .client
            .abort_multipart_upload()
            .bucket(&self.config.bucket_name)
            .key(object_key)
            .upload_id(upload_id)
            .send()
            .await
        {
            warn!(key = %object_key, error = %e, "Failed to abort multipart upload");
        }
    }
}

#[async_trait]
impl ArtifactStore for S3ArtifactStore {
    fn backend_name(&self) -> &'static str {
        "s3"
    }

    async fn put(&self, key: &str, mut stream: ByteStream) -> Result<u64, ArtifactError> {
        let object_key = self.object_key(key)?;

        // Buffer up to one part; small artifacts go out as a single put_object
        let mut buffer = BytesMut::with_capacity(PART_SIZE);
        while buffer.len() < PART_SIZE {
            match stream.next().await {
                Some(chunk) => buffer.extend_from_slice(&chunk?),
                None => {
                    let size = buffer.len() as u64;
                    self.put_single(&object_key, buffer.freeze()).await?;
                    debug!(key = %object_key, bytes = size, "Stored artifact object");
                    return Ok(size);
                }
            }
        }

        let upload_id = self.start_multipart(&object_key).await?;
        match self
            .finish_multipart(&object_key, &upload_id, buffer.freeze(), stream)
            .await
        {
            Ok(written) => {
                debug!(key = %object_key, bytes = written, "Stored artifact via multipart upload");
                Ok(written)
            }
            Err(e) => {
                self.abort_multipart(&object_key, &upload_id).await;
                Err(e)
            }
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes, ArtifactError> {
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false) {
                    ArtifactError::NotFound(key.to_string())
                } else {
                    ArtifactError::Storage(format!("Failed to get object {}: {}", object_key, e))
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to read object body: {}", e)))?;
        Ok(data.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool, ArtifactError> {
        match self.size(key).await {
            Ok(_) => Ok(true),
            Err(ArtifactError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn size(&self, key: &str) -> Result<u64, ArtifactError> {
        let object_key = self.object_key(key)?;
        let response = self
            .client
            .head_object()
            .bucket(&self.config.bucket_name)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false) {
                    ArtifactError::NotFound(key.to_string())
                } else {
                    ArtifactError::Storage(format!("Failed to head object {}: {}", object_key, e))
                }
            })?;

        Ok(response.content_length().unwrap_or(0).max(0) as u64)
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        let object_key = self.object_key(key)?;
        // S3 deletes are idempotent
        self.client
            .delete_object()
            .bucket(&self.config.bucket_name)
            .key(&object_key)
            .send()
            .await
            .map_err(|e| ArtifactError::Storage(format!("Failed to delete object {}: {}", object_key, e)))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, ArtifactError> {
        let full_prefix = format!("{}{}", self.config.key_prefix, prefix);
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.config.bucket_name)
                .prefix(&full_prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| ArtifactError::Storage(format!("Failed to list objects: {}", e)))?;

            keys.extend(response.contents().iter().filter_map(|object| {
                object
                    .key()
                    .and_then(|key| key.strip_prefix(&self.config.key_prefix))
                    .map(str::to_string)
            }));

            match response.next_continuation_token() {
                Some(token) => continuation = Some(token.to_string()),
                None => break,
            }
        }

        keys.sort();
        Ok(keys)
    }
}
