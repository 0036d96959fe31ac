use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::Error;

/// Row-level change kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "insert",
            ChangeKind::Update => "update",
            ChangeKind::Delete => "delete",
        }
    }
}

impl FromStr for ChangeKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "insert" => Ok(ChangeKind::Insert),
            "update" => Ok(ChangeKind::Update),
            "delete" => Ok(ChangeKind::Delete),
            other => Err(Error::UnsupportedChangeKind {
                kind: other.to_string(),
            }),
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One column of a row image: name, decoded value and declared type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Column {
    pub name: String,
    pub value: serde_json::Value,
    pub type_name: String,
}

impl Column {
    pub fn new(
        name: impl Into<String>,
        value: impl Into<serde_json::Value>,
        type_name: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            type_name: type_name.into(),
        }
    }
}

/// A single row mutation captured from the replication stream.
///
/// `columns` is the new row image and is empty for deletes. `old_key` is the
/// replica identity of the row before the change, present only when the
/// source table publishes it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub schema: String,
    pub table: String,
    pub columns: Vec<Column>,
    pub old_key: Option<Vec<Column>>,
}

impl ChangeEvent {
    pub fn qualified_table(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }
}

/// Log sequence number, PostgreSQL's monotonic WAL position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Lsn(pub u64);

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:X}/{:X}", self.0 >> 32, self.0 & 0xFFFF_FFFF)
    }
}

impl FromStr for Lsn {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidMessage {
            message: format!("Invalid LSN: {}", s),
        };
        let (hi, lo) = s.trim().split_once('/').ok_or_else(invalid)?;
        let hi = u64::from_str_radix(hi, 16).map_err(|_| invalid())?;
        let lo = u64::from_str_radix(lo, 16).map_err(|_| invalid())?;
        if hi > 0xFFFF_FFFF || lo > 0xFFFF_FFFF {
            return Err(invalid());
        }
        Ok(Lsn((hi << 32) | lo))
    }
}

/// All changes of one committed source transaction, in source order.
#[derive(Debug, Clone)]
pub struct SourceTransaction {
    pub lsn: Lsn,
    pub xid: Option<u32>,
    pub received_at: DateTime<Utc>,
    pub changes: Vec<ChangeEvent>,
}

impl SourceTransaction {
    pub fn new(lsn: Lsn, changes: Vec<ChangeEvent>) -> Self {
        Self {
            lsn,
            xid: None,
            received_at: Utc::now(),
            changes,
        }
    }

    pub fn with_xid(mut self, xid: u32) -> Self {
        self.xid = Some(xid);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}
