use crate::{config::KafkaConfig, Error, Result};
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::error::RDKafkaErrorCode;
use rdkafka::ClientConfig;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Creates the statement topic on first start.
///
/// The partition count bounds how many replay shards can make progress in
/// parallel.
pub struct TopicManager {
    admin_client: AdminClient<DefaultClientContext>,
    partitions: i32,
    replication_factor: i32,
}

impl TopicManager {
    pub fn new(config: &KafkaConfig) -> Result<Self> {
        let admin_client: AdminClient<_> = ClientConfig::new()
            .set("bootstrap.servers", config.brokers.join(","))
            .create()?;

        Ok(Self {
            admin_client,
            partitions: config.partitions,
            replication_factor: config.replication_factor,
        })
    }

    #[instrument(skip(self), fields(topic = %topic_name))]
    pub async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        match self.topic_partitions(topic_name)? {
            Some(partitions) => {
                if partitions as i32 != self.partitions {
                    warn!(
                        "Topic '{}' has {} partitions, configured {}",
                        topic_name, partitions, self.partitions
                    );
                }
                info!("Topic '{}' already exists", topic_name);
                Ok(())
            }
            None => {
                info!("Creating topic '{}'", topic_name);
                self.create_topic(topic_name).await
            }
        }
    }

    fn topic_partitions(&self, topic_name: &str) -> Result<Option<usize>> {
        let metadata = self
            .admin_client
            .inner()
            .fetch_metadata(Some(topic_name), Duration::from_secs(5))?;

        Ok(metadata
            .topics()
            .iter()
            .find(|topic| topic.name() == topic_name && topic.error().is_none())
            .map(|topic| topic.partitions().len()))
    }

    async fn create_topic(&self, topic_name: &str) -> Result<()> {
        let new_topic = NewTopic::new(
            topic_name,
            self.partitions,
            TopicReplication::Fixed(self.replication_factor),
        )
        .set("cleanup.policy", "delete")
        .set("retention.ms", "604800000"); // 7 days

        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(30)));

        let results = self.admin_client.create_topics(&[new_topic], &opts).await?;

        for result in results {
            match result {
                Ok(topic) => {
                    info!("Successfully created topic: {}", topic);
                }
                Err((_topic, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    info!("Topic '{}' was created concurrently", topic_name);
                }
                Err((_topic, error)) => {
                    return Err(Error::Kafka(rdkafka::error::KafkaError::AdminOp(error)));
                }
            }
        }

        Ok(())
    }
}
