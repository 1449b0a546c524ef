//! Delivery loop: pulls messages, dispatches them, settles them.

use std::sync::Arc;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::options::{BasicAckOptions, BasicNackOptions};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::dispatcher::{Disposition, Dispatcher};
use crate::error::BrokerError;

/// A broker delivery that can be settled once.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];

    async fn ack(&self) -> Result<(), BrokerError>;

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError>;
}

#[async_trait]
impl Delivery for lapin::message::Delivery {
    fn payload(&self) -> &[u8] {
        &self.data
    }

    async fn ack(&self) -> Result<(), BrokerError> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::SettleFailed(e.to_string()))
    }

    async fn nack(&self, requeue: bool) -> Result<(), BrokerError> {
        self.acker
            .nack(BasicNackOptions {
                requeue,
                ..Default::default()
            })
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::SettleFailed(e.to_string()))
    }
}

/// Consumes a delivery stream one message at a time.
pub struct TaskConsumer {
    dispatcher: Arc<Dispatcher>,
}

impl TaskConsumer {
    pub fn new(dispatcher: Arc<Dispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Runs until `shutdown` is cancelled, returning the number of settled deliveries.
    ///
    /// Cancellation is only observed between deliveries: a task that has started
    /// always reaches its ack decision first. A stream that ends on its own means
    /// the broker went away and is reported as [`BrokerError::StreamClosed`].
    pub async fn run<S, D, E>(
        &self,
        deliveries: S,
        shutdown: CancellationToken,
    ) -> Result<u64, BrokerError>
    where
        S: Stream<Item = Result<D, E>> + Unpin,
        D: Delivery,
        E: std::fmt::Display,
    {
        let mut deliveries = deliveries;
        let mut settled = 0u64;

        info!("Task consumer started");

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, consumer stopping");
                    break;
                }
                next = deliveries.next() => next,
            };

            let delivery = match next {
                Some(Ok(delivery)) => delivery,
                Some(Err(e)) => {
                    error!(error = %e, "Delivery stream error");
                    continue;
                }
                None => {
                    warn!(settled, "Delivery stream closed");
                    return Err(BrokerError::StreamClosed { settled });
                }
            };

            let disposition = self
                .dispatcher
                .dispatch_isolated(delivery.payload().to_vec())
                .await;
            if let Err(e) = settle(&delivery, disposition).await {
                error!(error = %e, ?disposition, "Failed to settle delivery");
            }
            settled += 1;
        }

        info!(settled, "Task consumer stopped");
        Ok(settled)
    }
}

async fn settle<D: Delivery>(delivery: &D, disposition: Disposition) -> Result<(), BrokerError> {
    debug!(?disposition, "Settling delivery");
    match disposition {
        Disposition::Ack => delivery.ack().await,
        Disposition::Requeue => delivery.nack(true).await,
        Disposition::Drop => delivery.nack(false).await,
    }
}
