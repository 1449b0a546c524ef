//! Commits a finished batch back to the product record and cache.

use std::sync::Arc;

use tracing::{info, warn};

use crate::error::RepositoryError;
use crate::product::{cache_key, ProcessingStatus, ProductCache, ProductRepository, StatusTracker};

/// Sole writer of the compressed image list.
pub struct Reconciler {
    repository: Arc<dyn ProductRepository>,
    cache: Arc<dyn ProductCache>,
}

impl Reconciler {
    pub fn new(repository: Arc<dyn ProductRepository>, cache: Arc<dyn ProductCache>) -> Self {
        Self { repository, cache }
    }

    /// Persists `images`, drops the cached product view and marks the product completed.
    ///
    /// Cache failures are logged and ignored. A persistence failure leaves the
    /// status untouched so the task can be redelivered.
    pub async fn commit(
        &self,
        tracker: &mut StatusTracker,
        images: &[String],
    ) -> Result<(), RepositoryError> {
        let product_id = tracker.product_id();

        self.repository
            .update_compressed_images(product_id, images)
            .await?;

        let key = cache_key(product_id);
        if let Err(e) = self.cache.delete(&key).await {
            warn!(product_id, key = %key, error = %e, "Failed to invalidate product cache");
        }

        tracker.advance(ProcessingStatus::Completed).await?;

        info!(product_id, images = images.len(), "Product images reconciled");
        Ok(())
    }
}
