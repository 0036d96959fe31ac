use chrono::{DateTime, Utc};
use std::collections::HashMap;

use super::key_strategy::KeyStrategy;
use crate::postgres::SourceTransaction;
use crate::sql::SqlBatch;
use crate::telemetry::TraceContext;
use crate::Result;

pub const LSN_HEADER: &str = "cdc-lsn";
pub const XID_HEADER: &str = "cdc-xid";
pub const CAPTURED_AT_HEADER: &str = "cdc-captured-at";

/// A publish-ready message: key, JSON statement list and headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub headers: Vec<(String, String)>,
}

impl Envelope {
    /// Wraps a rendered batch with the trace context of the transaction that
    /// produced it.
    pub fn build(
        transaction: &SourceTransaction,
        batch: &SqlBatch,
        trace: &TraceContext,
        key_strategy: &KeyStrategy,
    ) -> Result<Self> {
        let mut headers = trace.to_headers();
        headers.push((LSN_HEADER.to_string(), transaction.lsn.to_string()));
        if let Some(xid) = transaction.xid {
            headers.push((XID_HEADER.to_string(), xid.to_string()));
        }
        headers.push((
            CAPTURED_AT_HEADER.to_string(),
            transaction.received_at.to_rfc3339(),
        ));

        Ok(Self {
            key: key_strategy.extract_key(transaction),
            payload: batch.encode()?,
            headers,
        })
    }
}

/// Reads the capture timestamp back from consumed headers.
pub fn captured_at(headers: &HashMap<String, String>) -> Option<DateTime<Utc>> {
    headers
        .get(CAPTURED_AT_HEADER)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}
