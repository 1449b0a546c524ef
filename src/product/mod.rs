//! Product state: processing status, persistence and the read cache.

pub mod cache;
pub mod postgres;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CacheError, RepositoryError};

pub use cache::RedisProductCache;
pub use postgres::PgProductRepository;

/// Image processing status stored on the product record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl ProcessingStatus {
    /// Returns the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether a product in this status may move to `next`.
    ///
    /// Within one attempt the path is `pending -> processing -> completed | failed`.
    /// A redelivered task restarts at `processing` from any non-pending state.
    pub fn can_transition_to(&self, next: ProcessingStatus) -> bool {
        use ProcessingStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Processing)
                | (Completed, Processing)
                | (Failed, Processing)
        )
    }
}

impl fmt::Display for ProcessingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown processing status '{}'", other)),
        }
    }
}

/// Write access to product records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductRepository: Send + Sync {
    /// Sets the product's processing status.
    async fn update_processing_status(
        &self,
        product_id: u64,
        status: ProcessingStatus,
    ) -> Result<(), RepositoryError>;

    /// Replaces the product's compressed image list in a single statement.
    async fn update_compressed_images(
        &self,
        product_id: u64,
        images: &[String],
    ) -> Result<(), RepositoryError>;
}

/// Read cache holding rendered product views.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ProductCache: Send + Sync {
    /// Removes a cached entry. Deleting a missing key is not an error.
    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Cache key for a product's cached view.
pub fn cache_key(product_id: u64) -> String {
    format!("product:{}", product_id)
}

/// Tracks one product's status across a delivery attempt and rejects illegal moves.
pub struct StatusTracker {
    product_id: u64,
    current: ProcessingStatus,
    repository: Arc<dyn ProductRepository>,
}

impl StatusTracker {
    /// Starts tracking from the status the product is assumed to hold.
    ///
    /// A fresh delivery starts from `Pending`; a redelivery is indistinguishable
    /// and the `Pending -> Processing` move covers both.
    pub fn new(
        product_id: u64,
        current: ProcessingStatus,
        repository: Arc<dyn ProductRepository>,
    ) -> Self {
        Self {
            product_id,
            current,
            repository,
        }
    }

    pub fn product_id(&self) -> u64 {
        self.product_id
    }

    pub fn current(&self) -> ProcessingStatus {
        self.current
    }

    /// Persists `next` and records it as the current status.
    ///
    /// The in-memory status only changes once the write succeeds.
    pub async fn advance(&mut self, next: ProcessingStatus) -> Result<(), RepositoryError> {
        if !self.current.can_transition_to(next) {
            return Err(RepositoryError::InvalidTransition {
                product_id: self.product_id,
                from: self.current.to_string(),
                to: next.to_string(),
            });
        }

        self.repository
            .update_processing_status(self.product_id, next)
            .await?;

        debug!(
            product_id = self.product_id,
            from = %self.current,
            to = %next,
            "Processing status updated"
        );
        self.current = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    #[test]
    fn status_strings_round_trip() {
        for status in [
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
            ProcessingStatus::Completed,
            ProcessingStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<ProcessingStatus>(), Ok(status));
        }
        assert!("done".parse::<ProcessingStatus>().is_err());
    }

    #[test]
    fn serde_uses_snake_case() {
        let json = serde_json::to_string(&ProcessingStatus::Completed).unwrap();
        assert_eq!(json, "\"completed\"");
    }

    #[test]
    fn transition_table() {
        use ProcessingStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));

        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Completed));
        assert!(!Processing.can_transition_to(Pending));
    }

    #[test]
    fn cache_key_format() {
        assert_eq!(cache_key(1), "product:1");
    }

    #[tokio::test]
    async fn tracker_persists_legal_moves() {
        let mut repo = MockProductRepository::new();
        repo.expect_update_processing_status()
            .with(eq(4), eq(ProcessingStatus::Processing))
            .times(1)
            .returning(|_, _| Ok(()));

        let mut tracker = StatusTracker::new(4, ProcessingStatus::Pending, Arc::new(repo));
        tracker.advance(ProcessingStatus::Processing).await.unwrap();
        assert_eq!(tracker.current(), ProcessingStatus::Processing);
    }

    #[tokio::test]
    async fn tracker_rejects_illegal_moves_without_writing() {
        let mut repo = MockProductRepository::new();
        repo.expect_update_processing_status().times(0);

        let mut tracker = StatusTracker::new(4, ProcessingStatus::Pending, Arc::new(repo));
        let err = tracker
            .advance(ProcessingStatus::Completed)
            .await
            .unwrap_err();

        assert!(matches!(err, RepositoryError::InvalidTransition { .. }));
        assert_eq!(tracker.current(), ProcessingStatus::Pending);
    }

    #[tokio::test]
    async fn tracker_keeps_status_when_write_fails() {
        let mut repo = MockProductRepository::new();
        repo.expect_update_processing_status()
            .returning(|id, _| {
                Err(RepositoryError::UpdateFailed {
                    product_id: id,
                    message: "connection refused".into(),
                })
            });

        let mut tracker = StatusTracker::new(4, ProcessingStatus::Pending, Arc::new(repo));
        assert!(tracker.advance(ProcessingStatus::Processing).await.is_err());
        assert_eq!(tracker.current(), ProcessingStatus::Pending);
    }
}
