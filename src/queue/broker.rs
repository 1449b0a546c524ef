//! RabbitMQ connection, topology and publishing.

use async_trait::async_trait;
use lapin::options::{
    BasicConsumeOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer};
use tracing::{debug, info, warn};

use super::dead_letter::DeadLetterPublisher;
use crate::config::model::RabbitMqConfig;
use crate::error::BrokerError;

/// Main task queue.
pub const TASK_QUEUE: &str = "image_processing";
/// Dead-letter queue for malformed and permanently failed tasks.
pub const DEAD_LETTER_QUEUE: &str = "image_processing_dlq";
/// Unacknowledged deliveries per consumer. The broker holds everything else.
pub const PREFETCH_COUNT: u16 = 1;

/// AMQP persistent delivery mode.
const PERSISTENT: u8 = 2;

/// A RabbitMQ connection with a single channel.
pub struct Broker {
    connection: Connection,
    channel: Channel,
}

impl Broker {
    /// Connects and opens a channel with publisher confirms enabled.
    pub async fn connect(config: &RabbitMqConfig) -> Result<Self, BrokerError> {
        let connection = Connection::connect(
            &config.url,
            ConnectionProperties::default().with_connection_name(config.consumer_tag.clone().into()),
        )
        .await
        .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("channel creation failed: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("confirm mode failed: {}", e)))?;

        info!(url = %redacted(&config.url), "Connected to RabbitMQ");
        Ok(Self {
            connection,
            channel,
        })
    }

    /// Declares the main and dead-letter queues as durable.
    pub async fn declare_queues(&self) -> Result<(), BrokerError> {
        for queue in [TASK_QUEUE, DEAD_LETTER_QUEUE] {
            self.channel
                .queue_declare(
                    queue,
                    QueueDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::DeclareFailed {
                    queue: queue.to_string(),
                    message: e.to_string(),
                })?;
            debug!(queue, "Declared durable queue");
        }
        Ok(())
    }

    /// Sets prefetch and starts a manual-ack consumer on the task queue.
    pub async fn consume_tasks(&self, consumer_tag: &str) -> Result<Consumer, BrokerError> {
        self.channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::ConsumeFailed {
                queue: TASK_QUEUE.to_string(),
                message: format!("failed to set QoS: {}", e),
            })?;

        let consumer = self
            .channel
            .basic_consume(
                TASK_QUEUE,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::ConsumeFailed {
                queue: TASK_QUEUE.to_string(),
                message: e.to_string(),
            })?;

        info!(
            queue = TASK_QUEUE,
            prefetch = PREFETCH_COUNT,
            consumer_tag,
            "Consuming tasks"
        );
        Ok(consumer)
    }

    /// Publishes a persistent JSON message through the default exchange and waits for the confirm.
    pub async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        let publish_failed = |message: String| BrokerError::PublishFailed {
            queue: queue.to_string(),
            message,
        };

        let confirm = self
            .channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                payload,
                BasicProperties::default()
                    .with_delivery_mode(PERSISTENT)
                    .with_content_type("application/json".into()),
            )
            .await
            .map_err(|e| publish_failed(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| publish_failed(format!("confirmation failed: {}", e)))?;

        if confirmation.is_nack() {
            return Err(publish_failed("broker rejected the message".to_string()));
        }

        Ok(())
    }

    /// Fetches up to `limit` messages without consuming them.
    ///
    /// Every fetched message is nacked with requeue before returning, so the
    /// queue content is unchanged apart from the redelivered flag.
    pub async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Vec<u8>>, BrokerError> {
        let mut payloads = Vec::with_capacity(limit);
        let mut tags = Vec::with_capacity(limit);

        for _ in 0..limit {
            let message = self
                .channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| BrokerError::ConsumeFailed {
                    queue: queue.to_string(),
                    message: e.to_string(),
                })?;

            match message {
                Some(message) => {
                    tags.push(message.delivery.delivery_tag);
                    payloads.push(message.delivery.data.clone());
                }
                None => break,
            }
        }

        for tag in tags {
            if let Err(e) = self
                .channel
                .basic_nack(
                    tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await
            {
                warn!(queue, delivery_tag = tag, error = %e, "Failed to return peeked message");
            }
        }

        Ok(payloads)
    }

    /// Closes the channel and the connection.
    pub async fn close(&self) -> Result<(), BrokerError> {
        self.channel
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        self.connection
            .close(200, "shutdown")
            .await
            .map_err(|e| BrokerError::ConnectionFailed(e.to_string()))?;
        info!("RabbitMQ connection closed");
        Ok(())
    }
}

#[async_trait]
impl DeadLetterPublisher for Broker {
    async fn publish(&self, queue: &str, payload: &[u8]) -> Result<(), BrokerError> {
        Broker::publish(self, queue, payload).await
    }
}

/// Hides credentials in a broker URL for logging.
pub fn redacted(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}***{}", &url[..scheme_end + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}
