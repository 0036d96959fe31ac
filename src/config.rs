use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::kafka::KeyStrategy;
use crate::sql::{NumericLiteralPolicy, SqlSerializer};
use crate::telemetry::TelemetryConfig;
use crate::{Error, Result};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub postgres: PostgresConfig,
    pub target: TargetConfig,
    pub kafka: KafkaConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub replay: ReplayConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Source database holding the logical replication slot.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_slot_name")]
    pub slot_name: String,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default)]
    pub ssl_mode: SslMode,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    #[default]
    Disable,
    Prefer,
    Require,
}

/// Database the replay executors apply statements to.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TargetConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaConfig {
    pub brokers: Vec<String>,
    #[serde(default = "default_topic")]
    pub topic: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    #[serde(default = "default_group_prefix")]
    pub group_prefix: String,
    #[serde(default = "default_compression")]
    pub compression: String,
    #[serde(default = "default_acks")]
    pub acks: String,
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u32,
    #[serde(default = "default_message_timeout_ms")]
    pub message_timeout_ms: u32,
    #[serde(default = "default_session_timeout_ms")]
    pub session_timeout_ms: u32,
    #[serde(default = "default_auto_offset_reset")]
    pub auto_offset_reset: String,
    #[serde(default = "default_partitions")]
    pub partitions: i32,
    #[serde(default = "default_replication_factor")]
    pub replication_factor: i32,
    #[serde(default)]
    pub partition_key: KeyStrategy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CaptureConfig {
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_max_changes_per_poll")]
    pub max_changes_per_poll: i32,
    /// Fail instead of emitting full-table updates/deletes when the source
    /// sends no replica identity.
    #[serde(default)]
    pub require_old_key: bool,
    #[serde(default)]
    pub numeric_literals: NumericLiteralPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReplayConfig {
    /// Skip messages that carry no trace context instead of applying them.
    #[serde(default = "default_true")]
    pub skip_without_trace_context: bool,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            max_changes_per_poll: default_max_changes_per_poll(),
            require_old_key: false,
            numeric_literals: NumericLiteralPolicy::default(),
        }
    }
}

impl CaptureConfig {
    pub fn serializer(&self) -> SqlSerializer {
        SqlSerializer::new(self.require_old_key, self.numeric_literals)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            skip_without_trace_context: true,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .add_source(
                config::Environment::with_prefix("PG_SQL_REPLAY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("kafka.brokers")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| Error::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.kafka.brokers.iter().all(|b| b.trim().is_empty()) {
            return Err(Error::Config("kafka.brokers must not be empty".to_string()));
        }
        if self.kafka.topic.trim().is_empty() {
            return Err(Error::Config("kafka.topic must not be empty".to_string()));
        }
        if self.kafka.partitions < 1 {
            return Err(Error::Config("kafka.partitions must be at least 1".to_string()));
        }
        if self.capture.max_changes_per_poll < 1 {
            return Err(Error::Config(
                "capture.max_changes_per_poll must be at least 1".to_string(),
            ));
        }
        if self.postgres.slot_name.trim().is_empty() {
            return Err(Error::Config("postgres.slot_name must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn postgres_url(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.postgres.username,
            self.postgres.password,
            self.postgres.host,
            self.postgres.port,
            self.postgres.database
        )
    }

    pub fn consumer_group(&self, shard_id: &str) -> String {
        format!("{}-{}", self.kafka.group_prefix, shard_id)
    }
}

fn default_slot_name() -> String {
    "slot1".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_topic() -> String {
    "sql-topic".to_string()
}

fn default_client_id() -> String {
    "pg-sql-replay".to_string()
}

fn default_group_prefix() -> String {
    "sql-executor".to_string()
}

fn default_compression() -> String {
    "snappy".to_string()
}

fn default_acks() -> String {
    "all".to_string()
}

fn default_linger_ms() -> u32 {
    5
}

fn default_message_timeout_ms() -> u32 {
    30_000
}

fn default_session_timeout_ms() -> u32 {
    10_000
}

fn default_auto_offset_reset() -> String {
    "latest".to_string()
}

fn default_partitions() -> i32 {
    1
}

fn default_replication_factor() -> i32 {
    1
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_max_changes_per_poll() -> i32 {
    1000
}

fn default_true() -> bool {
    true
}
