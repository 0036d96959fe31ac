use async_trait::async_trait;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::{config::KafkaConfig, Result};

/// A consumed message, detached from the client's buffers.
#[derive(Debug, Clone, Default)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub payload: Option<Vec<u8>>,
    /// `None` when the message carried no headers at all.
    pub headers: Option<HashMap<String, String>>,
}

impl InboundMessage {
    fn from_borrowed(message: &BorrowedMessage<'_>) -> Self {
        let headers = message.headers().map(|headers| {
            headers
                .iter()
                .map(|h| {
                    let value = h
                        .value
                        .map(|v| String::from_utf8_lossy(v).into_owned())
                        .unwrap_or_default();
                    (h.key.to_string(), value)
                })
                .collect()
        });

        Self {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            payload: message.payload().map(<[u8]>::to_vec),
            headers,
        }
    }

    /// Payload as text, for logging.
    pub fn payload_text(&self) -> String {
        self.payload
            .as_deref()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .unwrap_or_default()
    }
}

/// Source of messages for one shard, in partition delivery order.
#[async_trait]
pub trait MessageSource: Send + Sync {
    /// Waits for the next message. `Ok(None)` means the source is exhausted.
    async fn next_message(&self) -> Result<Option<InboundMessage>>;
}

/// Manual offset commits toward the broker.
#[async_trait]
pub trait OffsetCommitter: Send + Sync {
    /// Marks everything up to and including `offset` as processed.
    async fn commit_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()>;
}

#[async_trait]
impl<T: OffsetCommitter + ?Sized> OffsetCommitter for Arc<T> {
    async fn commit_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        (**self).commit_offset(topic, partition, offset).await
    }
}

/// Kafka consumer for one shard's consumer group, auto-commit disabled.
///
/// Synchronous commits run on the blocking pool, so any tokio runtime
/// flavor can drive it.
pub struct ShardConsumer {
    consumer: Arc<StreamConsumer>,
}

impl ShardConsumer {
    pub fn new(config: &KafkaConfig, group_id: &str) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("group.id", group_id)
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", &config.auto_offset_reset)
            .set("session.timeout.ms", config.session_timeout_ms.to_string())
            .create()?;

        consumer.subscribe(&[config.topic.as_str()])?;
        info!(group_id, topic = %config.topic, "Subscribed shard consumer");

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }
}

#[async_trait]
impl MessageSource for ShardConsumer {
    async fn next_message(&self) -> Result<Option<InboundMessage>> {
        let message = self.consumer.recv().await?;
        Ok(Some(InboundMessage::from_borrowed(&message)))
    }
}

#[async_trait]
impl OffsetCommitter for ShardConsumer {
    async fn commit_offset(&self, topic: &str, partition: i32, offset: i64) -> Result<()> {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition_offset(topic, partition, Offset::Offset(offset + 1))?;

        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync))
            .await
            .map_err(std::io::Error::from)??;
        debug!(topic, partition, offset, "Committed offset");
        Ok(())
    }
}

impl Drop for ShardConsumer {
    fn drop(&mut self) {
        self.consumer.unsubscribe();
        debug!("Shard consumer unsubscribed");
    }
}
