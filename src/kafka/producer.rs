use async_trait::async_trait;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::debug;

use super::envelope::Envelope;
use crate::{config::KafkaConfig, Error, Result};

/// Where the capture side sends rendered batches.
#[async_trait]
pub trait BatchPublisher: Send + Sync {
    /// Publishes one envelope and waits for the broker acknowledgement.
    ///
    /// Returns the partition and offset the message landed on.
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(i32, i64)>;
}

pub struct KafkaProducer {
    producer: FutureProducer,
    message_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .set("client.id", &config.client_id)
            .set("compression.type", &config.compression)
            .set("acks", &config.acks)
            .set("enable.idempotence", "true")
            .set("linger.ms", config.linger_ms.to_string())
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .create()?;

        Ok(Self {
            producer,
            message_timeout: Duration::from_millis(u64::from(config.message_timeout_ms)),
        })
    }
}

#[async_trait]
impl BatchPublisher for KafkaProducer {
    async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(i32, i64)> {
        let headers = envelope
            .headers
            .iter()
            .fold(OwnedHeaders::new_with_capacity(envelope.headers.len()), |acc, (key, value)| {
                acc.insert(Header {
                    key: key.as_str(),
                    value: Some(value.as_str()),
                })
            });

        let mut record: FutureRecord<'_, str, [u8]> = FutureRecord::to(topic)
            .payload(envelope.payload.as_slice())
            .headers(headers);
        if let Some(key) = envelope.key.as_deref() {
            record = record.key(key);
        }

        let (partition, offset) = self
            .producer
            .send(record, self.message_timeout)
            .await
            .map_err(|(source, _)| Error::PublishFailure {
                topic: topic.to_string(),
                source,
            })?;

        debug!(topic, partition, offset, "Published batch");
        Ok((partition, offset))
    }
}
