//! Per-delivery task orchestration.
//!
//! One delivery moves through
//! `received -> processing -> image loop -> completed | failed`, and the
//! dispatcher turns the end state into an acknowledgement decision.

use std::sync::Arc;
use std::time::Instant;

use tracing::{error, info, warn};

use crate::metrics::Metrics;
use crate::product::{ProcessingStatus, ProductRepository, StatusTracker};
use crate::queue::task::product_id_hint;
use crate::queue::{DeadLetterReporter, ImageTask};
use crate::transcode::{retry, ImageProcessor, RetryPolicy};

use super::reconciler::Reconciler;

/// What to tell the broker about a delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished; remove the message.
    Ack,
    /// Transient failure; put the message back for redelivery.
    Requeue,
    /// Will never succeed; remove the message without redelivery.
    Drop,
}

/// How a task ended, for metrics and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    Failed,
    Malformed,
    Requeued,
}

impl TaskOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Malformed => "malformed",
            Self::Requeued => "requeued",
        }
    }

    pub fn disposition(&self) -> Disposition {
        match self {
            Self::Completed => Disposition::Ack,
            Self::Requeued => Disposition::Requeue,
            Self::Failed | Self::Malformed => Disposition::Drop,
        }
    }
}

/// Runs one task end to end against shared collaborators.
pub struct Dispatcher {
    processor: Arc<dyn ImageProcessor>,
    repository: Arc<dyn ProductRepository>,
    reconciler: Reconciler,
    dead_letter: DeadLetterReporter,
    retry: RetryPolicy,
    metrics: Arc<Metrics>,
}

impl Dispatcher {
    pub fn new(
        processor: Arc<dyn ImageProcessor>,
        repository: Arc<dyn ProductRepository>,
        reconciler: Reconciler,
        dead_letter: DeadLetterReporter,
        retry: RetryPolicy,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            processor,
            repository,
            reconciler,
            dead_letter,
            retry,
            metrics,
        }
    }

    /// Handles one raw delivery payload and decides how to settle it.
    pub async fn dispatch(&self, payload: &[u8]) -> Disposition {
        let started = Instant::now();
        self.metrics.set_in_progress(true);

        let outcome = self.run(payload).await;

        self.metrics
            .record_task(outcome.as_str(), started.elapsed().as_secs_f64());
        self.metrics.set_in_progress(false);
        outcome.disposition()
    }

    /// Runs [`dispatch`](Self::dispatch) on its own task so a panic only costs this message.
    ///
    /// A panicked task counts as a permanent failure: the product named by the
    /// payload, if any, is marked failed and the task is dead-lettered.
    pub async fn dispatch_isolated(self: &Arc<Self>, payload: Vec<u8>) -> Disposition {
        let started = Instant::now();
        let product_id = product_id_hint(&payload);
        let dispatcher = Arc::clone(self);

        let join_error = match tokio::spawn(async move { dispatcher.dispatch(&payload).await }).await
        {
            Ok(disposition) => return disposition,
            Err(e) => e,
        };

        error!(product_id, error = %join_error, "Task panicked, dropping message");
        self.metrics.set_in_progress(false);

        let reason = format!("task aborted: {}", join_error);
        let outcome = match product_id {
            Some(product_id) => {
                let mut tracker = StatusTracker::new(
                    product_id,
                    ProcessingStatus::Processing,
                    self.repository.clone(),
                );
                self.fail(&mut tracker, &reason).await
            }
            None => {
                self.dead_letter.report(0, &reason).await;
                TaskOutcome::Failed
            }
        };

        self.metrics
            .record_task(outcome.as_str(), started.elapsed().as_secs_f64());
        outcome.disposition()
    }

    async fn run(&self, payload: &[u8]) -> TaskOutcome {
        let task = match ImageTask::decode(payload) {
            Ok(task) => task,
            Err(e) => {
                let product_id = product_id_hint(payload).unwrap_or(0);
                warn!(product_id, error = %e, "Discarding malformed task");
                self.dead_letter.report(product_id, &e.to_string()).await;
                return TaskOutcome::Malformed;
            }
        };

        let product_id = task.product_id;
        info!(product_id, images = task.images.len(), "Processing task");

        let mut tracker =
            StatusTracker::new(product_id, ProcessingStatus::Pending, self.repository.clone());

        if let Err(e) = tracker.advance(ProcessingStatus::Processing).await {
            error!(product_id, error = %e, "Failed to mark product as processing");
            return TaskOutcome::Requeued;
        }

        let mut compressed = Vec::with_capacity(task.images.len());
        for (index, image) in task.images.iter().enumerate() {
            match self.process_with_retry(product_id, image).await {
                Ok(uri) => compressed.push(uri),
                Err(reason) => {
                    warn!(product_id, image = %image, index, error = %reason, "Image failed, abandoning task");
                    return self.fail(&mut tracker, &reason).await;
                }
            }
        }

        match self.reconciler.commit(&mut tracker, &compressed).await {
            Ok(()) => {
                info!(product_id, images = compressed.len(), "Task completed");
                TaskOutcome::Completed
            }
            Err(e) => {
                error!(product_id, error = %e, "Failed to reconcile product, requeueing");
                TaskOutcome::Requeued
            }
        }
    }

    async fn process_with_retry(&self, product_id: u64, image: &str) -> Result<String, String> {
        let processor = &self.processor;
        let metrics = &self.metrics;

        let result = retry(&self.retry, |attempt| async move {
            let result = processor.process_image(image).await;
            if let Err(e) = &result {
                metrics.record_attempt_failure();
                warn!(product_id, image, attempt, error = %e, "Image attempt failed");
            }
            result
        })
        .await;

        match result {
            Ok(uri) => {
                self.metrics.record_image();
                Ok(uri)
            }
            Err(exhausted) => Err(format!("image '{}': {}", image, exhausted)),
        }
    }

    /// Marks the product failed and dead-letters the task. The message is dropped
    /// even if the status write fails; the dead-letter record still carries the cause.
    async fn fail(&self, tracker: &mut StatusTracker, reason: &str) -> TaskOutcome {
        let product_id = tracker.product_id();

        if let Err(e) = tracker.advance(ProcessingStatus::Failed).await {
            error!(product_id, error = %e, "Failed to mark product as failed");
        }

        self.dead_letter.report(product_id, reason).await;
        TaskOutcome::Failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BrokerError, RepositoryError, TranscodeError};
    use crate::product::{MockProductCache, MockProductRepository};
    use crate::queue::dead_letter::MockDeadLetterPublisher;
    use crate::queue::DeadLetterRecord;
    use crate::transcode::MockImageProcessor;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::time::Duration;

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::ZERO,
            ..RetryPolicy::default()
        }
    }

    struct Fixture {
        processor: MockImageProcessor,
        repository: MockProductRepository,
        cache: MockProductCache,
        publisher: MockDeadLetterPublisher,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                processor: MockImageProcessor::new(),
                repository: MockProductRepository::new(),
                cache: MockProductCache::new(),
                publisher: MockDeadLetterPublisher::new(),
            }
        }

        fn build(self) -> (Dispatcher, Arc<Metrics>) {
            let metrics = Arc::new(Metrics::new().unwrap());
            let repository: Arc<dyn ProductRepository> = Arc::new(self.repository);
            let reconciler = Reconciler::new(repository.clone(), Arc::new(self.cache));
            let dead_letter = DeadLetterReporter::new(
                Arc::new(self.publisher),
                "image_processing_dlq",
                metrics.clone(),
            );
            let dispatcher = Dispatcher::new(
                Arc::new(self.processor),
                repository,
                reconciler,
                dead_letter,
                fast_retry(),
                metrics.clone(),
            );
            (dispatcher, metrics)
        }
    }

    fn payload(product_id: u64, images: &[&str]) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "product_id": product_id,
            "images": images,
        }))
        .unwrap()
    }

    fn not_an_image(url: &str) -> TranscodeError {
        TranscodeError::NotAnImage {
            url: url.to_string(),
            content_type: "text/html".into(),
        }
    }

    #[tokio::test]
    async fn all_images_succeed() {
        let mut f = Fixture::new();
        let mut seq = Sequence::new();

        f.repository
            .expect_update_processing_status()
            .with(eq(1), eq(ProcessingStatus::Processing))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        f.processor
            .expect_process_image()
            .withf(|url| url == "http://img/a.jpg")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("s3://bucket/compressed/1-a.jpg".into()));
        f.processor
            .expect_process_image()
            .withf(|url| url == "http://img/b.png")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok("s3://bucket/compressed/2-b.png".into()));
        f.repository
            .expect_update_compressed_images()
            .withf(|id, images| {
                *id == 1
                    && images
                        == [
                            "s3://bucket/compressed/1-a.jpg".to_string(),
                            "s3://bucket/compressed/2-b.png".to_string(),
                        ]
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        f.cache
            .expect_delete()
            .withf(|key| key == "product:1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        f.repository
            .expect_update_processing_status()
            .with(eq(1), eq(ProcessingStatus::Completed))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(()));
        f.publisher.expect_publish().times(0);

        let (dispatcher, metrics) = f.build();
        let disposition = dispatcher
            .dispatch(&payload(1, &["http://img/a.jpg", "http://img/b.png"]))
            .await;

        assert_eq!(disposition, Disposition::Ack);
        assert_eq!(metrics.tasks_with_outcome("completed"), 1);
    }

    #[tokio::test]
    async fn exhausted_image_fails_task_and_skips_the_rest() {
        let mut f = Fixture::new();

        f.repository
            .expect_update_processing_status()
            .with(eq(2), eq(ProcessingStatus::Processing))
            .times(1)
            .returning(|_, _| Ok(()));
        f.processor
            .expect_process_image()
            .withf(|url| url == "http://img/a.jpg")
            .times(1)
            .returning(|_| Ok("s3://bucket/compressed/1-a.jpg".into()));
        f.processor
            .expect_process_image()
            .withf(|url| url == "http://img/page.html")
            .times(3)
            .returning(|url| Err(not_an_image(url)));
        f.processor
            .expect_process_image()
            .withf(|url| url == "http://img/c.jpg")
            .times(0);
        f.repository.expect_update_compressed_images().times(0);
        f.cache.expect_delete().times(0);
        f.repository
            .expect_update_processing_status()
            .with(eq(2), eq(ProcessingStatus::Failed))
            .times(1)
            .returning(|_, _| Ok(()));
        f.publisher
            .expect_publish()
            .withf(|queue, payload| {
                let record: DeadLetterRecord = serde_json::from_slice(payload).unwrap();
                queue == "image_processing_dlq"
                    && record.product_id == 2
                    && record.error.contains("http://img/page.html")
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let (dispatcher, metrics) = f.build();
        let disposition = dispatcher
            .dispatch(&payload(
                2,
                &["http://img/a.jpg", "http://img/page.html", "http://img/c.jpg"],
            ))
            .await;

        assert_eq!(disposition, Disposition::Drop);
        assert_eq!(metrics.tasks_with_outcome("failed"), 1);
        assert_eq!(metrics.image_attempt_failures.get() as u64, 3);
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_without_status_update() {
        let mut f = Fixture::new();

        f.repository.expect_update_processing_status().times(0);
        f.processor.expect_process_image().times(0);
        f.publisher
            .expect_publish()
            .withf(|_, payload| {
                let record: DeadLetterRecord = serde_json::from_slice(payload).unwrap();
                record.product_id == 0
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let (dispatcher, metrics) = f.build();
        let disposition = dispatcher.dispatch(b"{not json").await;

        assert_eq!(disposition, Disposition::Drop);
        assert_eq!(metrics.tasks_with_outcome("malformed"), 1);
    }

    #[tokio::test]
    async fn status_write_failure_requeues_before_any_image_work() {
        let mut f = Fixture::new();

        f.repository
            .expect_update_processing_status()
            .times(1)
            .returning(|id, _| {
                Err(RepositoryError::UpdateFailed {
                    product_id: id,
                    message: "connection refused".into(),
                })
            });
        f.processor.expect_process_image().times(0);
        f.publisher.expect_publish().times(0);

        let (dispatcher, metrics) = f.build();
        let disposition = dispatcher.dispatch(&payload(3, &["http://img/a.jpg"])).await;

        assert_eq!(disposition, Disposition::Requeue);
        assert_eq!(metrics.tasks_with_outcome("requeued"), 1);
    }

    #[tokio::test]
    async fn reconcile_failure_requeues() {
        let mut f = Fixture::new();

        f.repository
            .expect_update_processing_status()
            .with(eq(4), eq(ProcessingStatus::Processing))
            .returning(|_, _| Ok(()));
        f.processor
            .expect_process_image()
            .returning(|_| Ok("s3://bucket/compressed/1-a.jpg".into()));
        f.repository
            .expect_update_compressed_images()
            .returning(|id, _| {
                Err(RepositoryError::UpdateFailed {
                    product_id: id,
                    message: "deadlock".into(),
                })
            });
        f.publisher.expect_publish().times(0);

        let (dispatcher, _) = f.build();
        let disposition = dispatcher.dispatch(&payload(4, &["http://img/a.jpg"])).await;

        assert_eq!(disposition, Disposition::Requeue);
    }

    #[tokio::test]
    async fn dead_letter_failure_still_drops() {
        let mut f = Fixture::new();

        f.repository
            .expect_update_processing_status()
            .returning(|_, _| Ok(()));
        f.processor
            .expect_process_image()
            .returning(|url| Err(not_an_image(url)));
        f.publisher.expect_publish().returning(|queue, _| {
            Err(BrokerError::PublishFailed {
                queue: queue.to_string(),
                message: "channel closed".into(),
            })
        });

        let (dispatcher, metrics) = f.build();
        let disposition = dispatcher.dispatch(&payload(5, &["http://img/a.jpg"])).await;

        assert_eq!(disposition, Disposition::Drop);
        assert_eq!(metrics.dead_letters_published(), 0);
    }

    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn each_failed_attempt_is_logged_once() {
        let logs = CapturedLogs::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let mut f = Fixture::new();
        f.repository
            .expect_update_processing_status()
            .returning(|_, _| Ok(()));
        f.processor
            .expect_process_image()
            .times(3)
            .returning(|url| Err(not_an_image(url)));
        f.publisher.expect_publish().returning(|_, _| Ok(()));

        let (dispatcher, _) = f.build();
        dispatcher.dispatch(&payload(6, &["http://img/page.html"])).await;

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        let warnings: Vec<&str> = output.lines().filter(|l| l.contains("WARN")).collect();
        assert_eq!(
            warnings
                .iter()
                .filter(|l| l.contains("Image attempt failed"))
                .count(),
            3
        );
        // Three attempts plus the abandoned task.
        assert_eq!(warnings.len(), 4, "unexpected warnings:\n{}", output);
    }

    #[test]
    fn outcome_dispositions() {
        assert_eq!(TaskOutcome::Completed.disposition(), Disposition::Ack);
        assert_eq!(TaskOutcome::Requeued.disposition(), Disposition::Requeue);
        assert_eq!(TaskOutcome::Failed.disposition(), Disposition::Drop);
        assert_eq!(TaskOutcome::Malformed.disposition(), Disposition::Drop);
    }
}
