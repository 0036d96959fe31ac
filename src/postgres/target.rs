use async_trait::async_trait;
use tracing::trace;

use super::connection::PgConnection;
use crate::{Error, Result};

/// Session setting applied inside every replayed transaction. Commit
/// latency is traded for throughput; Kafka still holds the message until its
/// offset is committed.
pub const RELAXED_DURABILITY: &str = "SET LOCAL synchronous_commit = off";

/// Database that replayed statements are applied to.
#[async_trait]
pub trait TargetDatabase: Send {
    /// Executes one statement as its own unit of work.
    async fn execute(&mut self, statement: &str) -> Result<()>;

    /// Executes statements in order inside one transaction with relaxed
    /// durability, committing only if all succeed.
    async fn execute_transaction(&mut self, statements: &[String]) -> Result<()>;
}

/// [`TargetDatabase`] over a dedicated PostgreSQL session.
pub struct PostgresTarget {
    connection: PgConnection,
}

impl PostgresTarget {
    pub fn new(connection: PgConnection) -> Self {
        Self { connection }
    }
}

#[async_trait]
impl TargetDatabase for PostgresTarget {
    async fn execute(&mut self, statement: &str) -> Result<()> {
        trace!(statement, "Executing statement");
        self.connection
            .client()
            .batch_execute(statement)
            .await
            .map_err(|e| Error::apply(statement, e))
    }

    async fn execute_transaction(&mut self, statements: &[String]) -> Result<()> {
        let tx = self
            .connection
            .client_mut()
            .transaction()
            .await
            .map_err(|e| Error::apply("BEGIN", e))?;

        tx.batch_execute(RELAXED_DURABILITY)
            .await
            .map_err(|e| Error::apply(RELAXED_DURABILITY, e))?;

        for statement in statements {
            trace!(statement = %statement, "Executing statement in transaction");
            tx.batch_execute(statement)
                .await
                .map_err(|e| Error::apply(statement.as_str(), e))?;
        }

        tx.commit().await.map_err(|e| Error::apply("COMMIT", e))
    }
}
