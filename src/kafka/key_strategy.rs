use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::postgres::SourceTransaction;

/// How published batches are keyed, and therefore partitioned.
///
/// Ordering is only guaranteed within a partition, so the key decides which
/// transactions are replayed in order relative to each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// No key; the broker's default partitioner decides.
    #[default]
    None,
    /// Source transaction id, falling back to the commit LSN.
    Transaction,
    /// Schema-qualified table of the transaction's first change.
    Table,
}

impl KeyStrategy {
    pub fn extract_key(&self, transaction: &SourceTransaction) -> Option<String> {
        match self {
            KeyStrategy::None => None,

            KeyStrategy::Transaction => Some(match transaction.xid {
                Some(xid) => xid.to_string(),
                None => transaction.lsn.to_string(),
            }),

            KeyStrategy::Table => match transaction.changes.first() {
                Some(change) => Some(change.qualified_table()),
                None => {
                    debug!("No change available for key extraction");
                    None
                }
            },
        }
    }
}
