use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::connection::PgConnection;
use super::types::Lsn;
use crate::{Error, Result};

pub const OUTPUT_PLUGIN: &str = "wal2json";

/// Ordered stream of committed transactions from the source.
#[async_trait]
pub trait ChangeSource: Send {
    /// Returns the next pending transactions as `(commit position, wal2json
    /// document)` pairs, oldest first. Transactions already acknowledged are
    /// never returned again by the same source.
    async fn poll(&mut self) -> Result<Vec<(Lsn, String)>>;

    /// Confirms that everything up to and including `lsn` is safely
    /// published, letting the source discard it.
    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()>;
}

/// Reads a wal2json logical replication slot over a regular SQL session.
///
/// Changes are peeked rather than consumed, and the slot only moves forward
/// in [`ChangeSource::acknowledge`], so a crash between read and publish
/// replays the transaction instead of losing it.
pub struct SlotReader {
    connection: PgConnection,
    slot_name: String,
    max_changes: i32,
    last_acknowledged: Option<Lsn>,
}

impl SlotReader {
    pub fn new(connection: PgConnection, slot_name: String, max_changes: i32) -> Self {
        Self {
            connection,
            slot_name,
            max_changes,
            last_acknowledged: None,
        }
    }

    /// Creates the slot if it does not exist yet.
    pub async fn ensure_slot(&mut self) -> Result<()> {
        let rows = self
            .connection
            .client()
            .query(
                "SELECT plugin, confirmed_flush_lsn::text FROM pg_replication_slots WHERE slot_name = $1",
                &[&self.slot_name],
            )
            .await?;

        if let Some(row) = rows.first() {
            let plugin: Option<String> = row.get(0);
            let confirmed: Option<String> = row.get(1);
            if plugin.as_deref() != Some(OUTPUT_PLUGIN) {
                return Err(Error::Config(format!(
                    "Replication slot '{}' uses plugin {:?}, expected {}",
                    self.slot_name, plugin, OUTPUT_PLUGIN
                )));
            }
            info!(
                "Replication slot '{}' already exists, confirmed up to {}",
                self.slot_name,
                confirmed.as_deref().unwrap_or("unknown")
            );
            return Ok(());
        }

        let row = self
            .connection
            .client()
            .query_one(
                "SELECT lsn::text FROM pg_create_logical_replication_slot($1, $2)",
                &[&self.slot_name, &OUTPUT_PLUGIN],
            )
            .await?;
        let lsn: String = row.get(0);
        info!("Created replication slot '{}' at LSN {}", self.slot_name, lsn);
        Ok(())
    }

    pub async fn drop_slot(&mut self) -> Result<()> {
        match self
            .connection
            .client()
            .execute("SELECT pg_drop_replication_slot($1)", &[&self.slot_name])
            .await
        {
            Ok(_) => {
                info!("Dropped replication slot '{}'", self.slot_name);
                Ok(())
            }
            Err(e) if e.to_string().contains("does not exist") => {
                warn!("Replication slot '{}' does not exist", self.slot_name);
                Ok(())
            }
            Err(e) => Err(Error::Postgres(e)),
        }
    }
}

#[async_trait]
impl ChangeSource for SlotReader {
    async fn poll(&mut self) -> Result<Vec<(Lsn, String)>> {
        let rows = self
            .connection
            .client()
            .query(
                "SELECT lsn::text, data FROM pg_logical_slot_peek_changes($1, NULL, $2, \
                 'format-version', '1', 'include-xids', '1', 'include-types', '1', \
                 'include-timestamp', '0')",
                &[&self.slot_name, &self.max_changes],
            )
            .await?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            let lsn: Lsn = row.get::<_, String>(0).parse()?;
            if self.last_acknowledged.is_some_and(|acked| lsn <= acked) {
                continue;
            }
            transactions.push((lsn, row.get::<_, String>(1)));
        }

        if !transactions.is_empty() {
            debug!(count = transactions.len(), "Peeked transactions from slot");
        }
        Ok(transactions)
    }

    async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
        self.connection
            .client()
            .query_one(
                "SELECT end_lsn::text FROM pg_replication_slot_advance($1, $2::text::pg_lsn)",
                &[&self.slot_name, &lsn.to_string()],
            )
            .await?;
        self.last_acknowledged = Some(lsn);
        Ok(())
    }
}
