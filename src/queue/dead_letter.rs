//! Dead letter reporting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::error::BrokerError;
use crate::metrics::Metrics;

/// Destination for dead-letter payloads.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// Publishes a raw JSON payload to the named queue.
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError>;
}

/// Diagnostic record for a task that will never succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    /// Product the task belonged to (0 when the payload carried none).
    pub product_id: u64,
    /// Human-readable failure description.
    pub error: String,
    /// When the failure was recorded.
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterRecord {
    /// Creates a record stamped with the current time.
    pub fn new(product_id: u64, error: impl Into<String>) -> Self {
        Self {
            product_id,
            error: error.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Publishes dead-letter records on a best-effort basis.
///
/// Failures are logged and counted but never surfaced: the caller's
/// acknowledgement decision does not depend on the dead-letter path.
pub struct DeadLetterReporter {
    publisher: Arc<dyn DeadLetterPublisher>,
    queue: String,
    metrics: Arc<Metrics>,
}

impl DeadLetterReporter {
    /// Creates a reporter publishing to `queue`.
    pub fn new(
        publisher: Arc<dyn DeadLetterPublisher>,
        queue: impl Into<String>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            publisher,
            queue: queue.into(),
            metrics,
        }
    }

    /// Reports a failure. Returns whether the record reached the broker.
    pub async fn report(&self, product_id: u64, error: &str) -> bool {
        let record = DeadLetterRecord::new(product_id, error);

        let payload = match serde_json::to_vec(&record) {
            Ok(payload) => payload,
            Err(e) => {
                error!(product_id, error = %e, "Failed to serialize dead letter record");
                self.metrics.record_dead_letter_failure();
                return false;
            }
        };

        match self.publisher.publish(&self.queue, &payload).await {
            Ok(()) => {
                info!(product_id, queue = %self.queue, reason = %error, "Task dead-lettered");
                self.metrics.record_dead_letter();
                true
            }
            Err(e) => {
                error!(product_id, queue = %self.queue, error = %e, "Failed to publish to DLQ");
                self.metrics.record_dead_letter_failure();
                false
            }
        }
    }
}
