//! Blob storage for compressed images.

pub mod s3;

use async_trait::async_trait;

use crate::error::StorageError;

pub use s3::S3BlobStore;

/// Object storage used for compressed image output.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Stores `data` under `key` and returns a reference URI for it.
    async fn upload(&self, key: &str, data: Vec<u8>, content_type: &str)
        -> Result<String, StorageError>;

    /// Reads back the object stored under `key`.
    async fn download(&self, key: &str) -> Result<Vec<u8>, StorageError>;
}
