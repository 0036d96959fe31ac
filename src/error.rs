//! Error types and result handling for pg-sql-replay.
//!
//! This module defines the main error type [`Error`] and a convenience
//! [`Result`] type alias used throughout the crate.
//!
//! Errors fall into two camps. On the capture side anything that could make
//! the replication slot advance past an unpublished transaction is fatal
//! (see [`Error::is_fatal`]). On the replay side errors are caught at the
//! per-message boundary and never stop a shard.
//!
//! # Example
//!
//! ```rust
//! use pg_sql_replay::{Error, Result};
//!
//! fn render_kind(kind: &str) -> Result<()> {
//!     Err(Error::UnsupportedChangeKind { kind: kind.to_string() })
//! }
//!
//! match render_kind("truncate") {
//!     Ok(()) => println!("rendered"),
//!     Err(e) if e.is_fatal() => eprintln!("fatal: {}", e),
//!     Err(e) => eprintln!("other error: {}", e),
//! }
//! ```

use thiserror::Error;

/// Boxed error used where the underlying client error type varies.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The main error type for pg-sql-replay operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error, from the config file, environment or validation.
    #[error("Configuration error: {0}")]
    Config(String),

    /// PostgreSQL client or protocol error.
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    /// Kafka client error outside of publishing (admin, consumer setup).
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    /// JSON serialization error when encoding or decoding payloads.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error, including a blocking client call whose worker task failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A change event carried a kind the serializer cannot render.
    ///
    /// Indicates protocol drift with the capture source.
    #[error("Unsupported change kind: {kind}")]
    UnsupportedChangeKind {
        /// The kind string as delivered by the decoder
        kind: String,
    },

    /// An update or delete arrived without replica identity data while
    /// `require_old_key` is enabled.
    #[error("Missing old key for {kind} on {table}")]
    MissingOldKey {
        /// Schema-qualified table name
        table: String,
        /// Change kind (update or delete)
        kind: String,
    },

    /// A value declared numeric was not well-formed numeric text and the
    /// numeric literal policy is `reject`.
    #[error("Untrusted numeric literal in column {column}: {value}")]
    UntrustedNumericLiteral {
        /// Column carrying the value
        column: String,
        /// The offending text
        value: String,
    },

    /// The batcher was handed a transaction without changes.
    #[error("Transaction {lsn} has no changes")]
    EmptyTransaction {
        /// Commit position of the transaction
        lsn: String,
    },

    /// The broker rejected a publish or was unreachable.
    #[error("Failed to publish to topic {topic}: {source}")]
    PublishFailure {
        /// Destination topic
        topic: String,
        #[source]
        source: rdkafka::error::KafkaError,
    },

    /// The target database rejected or timed out on a statement.
    #[error("Failed to apply statement `{statement}`: {source}")]
    ApplyFailure {
        /// The statement that failed
        statement: String,
        #[source]
        source: BoxError,
    },

    /// Invalid or malformed replication or envelope message.
    #[error("Invalid message format: {message}")]
    InvalidMessage {
        /// Description of what was invalid
        message: String,
    },
}

impl Error {
    /// Wraps a target database error together with the statement it failed on.
    pub fn apply(statement: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Error::ApplyFailure {
            statement: statement.into(),
            source: source.into(),
        }
    }

    /// Whether the capture process must stop on this error.
    ///
    /// Resuming the slot past an unpublished or unrenderable transaction
    /// would silently lose data, so everything except replay-side apply
    /// failures is fatal.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::ApplyFailure { .. })
    }
}

/// A convenient Result type alias for pg-sql-replay operations.
///
/// This is equivalent to `std::result::Result<T, pg_sql_replay::Error>`.
pub type Result<T> = std::result::Result<T, Error>;
