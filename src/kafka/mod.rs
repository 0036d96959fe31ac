pub mod consumer;
pub mod envelope;
pub mod key_strategy;
pub mod producer;
pub mod topic_manager;

pub use consumer::{InboundMessage, MessageSource, OffsetCommitter, ShardConsumer};
pub use envelope::Envelope;
pub use key_strategy::KeyStrategy;
pub use producer::{BatchPublisher, KafkaProducer};
pub use topic_manager::TopicManager;
