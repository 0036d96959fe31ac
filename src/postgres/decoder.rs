use serde::Deserialize;
use tracing::{debug, trace};

use super::types::{ChangeEvent, ChangeKind, Column, Lsn, SourceTransaction};
use crate::{Error, Result};

/// One transaction as emitted by wal2json with `format-version` 1.
#[derive(Debug, Deserialize)]
struct RawTransaction {
    #[serde(default)]
    xid: Option<u32>,
    #[serde(default)]
    change: Vec<RawChange>,
}

#[derive(Debug, Deserialize)]
struct RawChange {
    kind: String,
    #[serde(default)]
    schema: String,
    #[serde(default)]
    table: String,
    #[serde(default)]
    columnnames: Vec<String>,
    #[serde(default)]
    columntypes: Vec<String>,
    #[serde(default)]
    columnvalues: Vec<serde_json::Value>,
    #[serde(default)]
    oldkeys: Option<RawOldKeys>,
}

#[derive(Debug, Deserialize)]
struct RawOldKeys {
    #[serde(default)]
    keynames: Vec<String>,
    #[serde(default)]
    keytypes: Vec<String>,
    #[serde(default)]
    keyvalues: Vec<serde_json::Value>,
}

/// Turns wal2json transaction documents into [`SourceTransaction`]s.
pub struct Wal2JsonDecoder;

impl Wal2JsonDecoder {
    pub fn decode(lsn: Lsn, data: &str) -> Result<SourceTransaction> {
        let raw: RawTransaction = serde_json::from_str(data).map_err(|e| Error::InvalidMessage {
            message: format!("Invalid wal2json document at {}: {}", lsn, e),
        })?;

        let mut changes = Vec::with_capacity(raw.change.len());
        for change in raw.change {
            changes.push(decode_change(change)?);
        }

        trace!(lsn = %lsn, xid = ?raw.xid, changes = changes.len(), "Decoded transaction");

        let mut transaction = SourceTransaction::new(lsn, changes);
        if let Some(xid) = raw.xid {
            transaction = transaction.with_xid(xid);
        }
        Ok(transaction)
    }
}

fn decode_change(raw: RawChange) -> Result<ChangeEvent> {
    let kind: ChangeKind = raw.kind.parse()?;

    let columns = zip_columns(
        &raw.schema,
        &raw.table,
        raw.columnnames,
        raw.columntypes,
        raw.columnvalues,
    )?;

    let old_key = match raw.oldkeys {
        Some(keys) => Some(zip_columns(
            &raw.schema,
            &raw.table,
            keys.keynames,
            keys.keytypes,
            keys.keyvalues,
        )?),
        None => {
            if kind != ChangeKind::Insert {
                debug!(
                    "{} on {}.{} carries no old key",
                    kind, raw.schema, raw.table
                );
            }
            None
        }
    };

    Ok(ChangeEvent {
        kind,
        schema: raw.schema,
        table: raw.table,
        columns,
        old_key,
    })
}

/// Zips the parallel name/type/value arrays into columns.
///
/// wal2json omits the type array when `include-types` is off; columns then
/// fall back to `text`, which quotes every value.
fn zip_columns(
    schema: &str,
    table: &str,
    names: Vec<String>,
    types: Vec<String>,
    values: Vec<serde_json::Value>,
) -> Result<Vec<Column>> {
    if names.len() != values.len() || (!types.is_empty() && types.len() != names.len()) {
        return Err(Error::InvalidMessage {
            message: format!(
                "Column arrays misaligned on {}.{}: {} names, {} types, {} values",
                schema,
                table,
                names.len(),
                types.len(),
                values.len()
            ),
        });
    }

    let mut types = types.into_iter();
    Ok(names
        .into_iter()
        .zip(values)
        .map(|(name, value)| Column {
            name,
            value,
            type_name: types.next().unwrap_or_else(|| "text".to_string()),
        })
        .collect())
}
