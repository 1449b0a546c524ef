//! Per-image download, recompression and upload.

pub mod engine;
pub mod retry;

use async_trait::async_trait;

use crate::error::TranscodeError;

pub use engine::Transcoder;
pub use retry::{retry, Classify, RetryExhausted, RetryPolicy};

/// Turns one source image locator into a stored compressed copy.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImageProcessor: Send + Sync {
    /// Processes one image and returns the destination URI.
    async fn process_image(&self, url: &str) -> Result<String, TranscodeError>;
}
