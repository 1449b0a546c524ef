//! S3-backed blob store.

use async_trait::async_trait;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use super::BlobStore;
use crate::config::model::StorageConfig;
use crate::error::StorageError;

/// Stores objects in a single S3 bucket.
#[derive(Clone)]
pub struct S3BlobStore {
    client: Client,
    bucket: String,
}

impl S3BlobStore {
    /// Builds a client from the ambient AWS credential chain and the configured region.
    ///
    /// A custom endpoint switches to path-style addressing for S3-compatible servers.
    pub async fn from_config(config: &StorageConfig) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()));
        if let Some(endpoint) = &config.endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let s3_config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(config.endpoint.is_some())
            .build();

        info!(
            bucket = %config.bucket,
            region = %config.region,
            endpoint = ?config.endpoint,
            "S3 client configured"
        );

        Self::new(Client::from_conf(s3_config), config.bucket.clone())
    }

    /// Wraps an existing client.
    pub fn new(client: Client, bucket: String) -> Self {
        Self { client, bucket }
    }

    /// Reference URI for an object in this bucket.
    pub fn object_uri(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn upload(
        &self,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<String, StorageError> {
        let size = data.len();

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?;

        debug!(key, size, content_type, "Uploaded object");
        Ok(self.object_uri(key))
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| match &e {
                SdkError::ServiceError(service) if service.err().is_no_such_key() => {
                    StorageError::NotFound {
                        key: key.to_string(),
                    }
                }
                _ => StorageError::DownloadFailed {
                    key: key.to_string(),
                    message: e.to_string(),
                },
            })?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadFailed {
                key: key.to_string(),
                message: e.to_string(),
            })?
            .into_bytes();

        Ok(bytes.to_vec())
    }
}
