use serde::{Deserialize, Serialize};
use tracing::warn;

use super::serializer::SqlSerializer;
use crate::postgres::SourceTransaction;
use crate::{Error, Result};

pub const BEGIN_MARKER: &str = "BEGIN;";
pub const COMMIT_MARKER: &str = "COMMIT;";

/// Ordered statements for one source transaction.
///
/// When built from more than one change the statements are bracketed by
/// [`BEGIN_MARKER`] and [`COMMIT_MARKER`], and everything between them must
/// be applied as one downstream transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SqlBatch {
    statements: Vec<String>,
}

/// How the replay side applies a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyPlan<'a> {
    /// Interior statements inside one transaction, markers stripped.
    Transactional(&'a [String]),
    /// Each statement as its own unit of work.
    Standalone(&'a [String]),
}

impl SqlBatch {
    pub fn new(statements: Vec<String>) -> Self {
        Self { statements }
    }

    pub fn statements(&self) -> &[String] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// The batch as one script, statements separated by newlines.
    pub fn to_script(&self) -> String {
        self.statements.join("\n")
    }

    /// Serializes the batch as a JSON array of statements.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&self.statements)?)
    }

    /// Parses a message value.
    ///
    /// Accepts the JSON array form, and falls back to a newline-joined
    /// script for payloads produced by older capture processes.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        if let Ok(statements) = serde_json::from_slice::<Vec<String>>(payload) {
            return Ok(Self::new(statements));
        }

        let script = std::str::from_utf8(payload).map_err(|e| Error::InvalidMessage {
            message: format!("Payload is neither a JSON array nor UTF-8 text: {}", e),
        })?;
        if script.trim_start().starts_with('[') {
            return Err(Error::InvalidMessage {
                message: "Payload looks like JSON but is not an array of strings".to_string(),
            });
        }

        warn!("Decoding legacy newline-joined payload");
        Ok(Self::new(
            script
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect(),
        ))
    }

    /// Splits the batch into the statements to run and how to run them.
    pub fn plan(&self) -> ApplyPlan<'_> {
        let statements = self.statements.as_slice();
        match statements {
            [first, rest @ ..] if is_marker(first, "BEGIN") && !rest.is_empty() => {
                let interior = match rest {
                    [body @ .., last] if is_marker(last, "COMMIT") => body,
                    _ => rest,
                };
                ApplyPlan::Transactional(interior)
            }
            _ => ApplyPlan::Standalone(statements),
        }
    }
}

/// Matches `BEGIN`, `begin;`, ` COMMIT ; ` and the like.
fn is_marker(statement: &str, keyword: &str) -> bool {
    let trimmed = statement.trim();
    let trimmed = trimmed.strip_suffix(';').unwrap_or(trimmed).trim_end();
    trimmed.eq_ignore_ascii_case(keyword)
}

/// Renders a source transaction into a batch.
///
/// Wrapping depends only on the number of changes, never on their kinds.
pub fn batch_transaction(serializer: &SqlSerializer, transaction: &SourceTransaction) -> Result<SqlBatch> {
    let changes = &transaction.changes;
    if changes.is_empty() {
        return Err(Error::EmptyTransaction {
            lsn: transaction.lsn.to_string(),
        });
    }

    let wrap = changes.len() > 1;
    let mut statements = Vec::with_capacity(changes.len() + if wrap { 2 } else { 0 });

    if wrap {
        statements.push(BEGIN_MARKER.to_string());
    }
    for change in changes {
        statements.push(serializer.render(change)?);
    }
    if wrap {
        statements.push(COMMIT_MARKER.to_string());
    }

    Ok(SqlBatch::new(statements))
}
