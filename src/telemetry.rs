//! Distributed trace propagation and metrics.
//!
//! A [`Telemetry`] handle is built once per process in `main` and passed to
//! the capture service and to each replay executor. It owns the metric
//! handles for its service and mints the trace contexts that travel across
//! Kafka in W3C `traceparent` / `tracestate` headers, so one source
//! transaction shows up as one trace from capture to replay.
//!
//! Span and metric export is left to whatever `tracing` subscriber and
//! `metrics` recorder the process installs.
//!
//! # Example
//!
//! ```rust
//! use pg_sql_replay::telemetry::{Telemetry, TraceContext};
//! use std::collections::HashMap;
//!
//! let producer = Telemetry::new("capture");
//! let ctx = producer.start_trace();
//!
//! let headers: HashMap<String, String> = ctx.to_headers().into_iter().collect();
//! let parent = TraceContext::from_headers(&headers).unwrap();
//!
//! let consumer = Telemetry::new("sql-shard-0");
//! let child = consumer.continue_trace(&parent);
//! assert_eq!(child.trace_id(), ctx.trace_id());
//! assert_eq!(child.parent_span_id(), Some(ctx.span_id()));
//! ```

use metrics::{counter, histogram, Counter, Histogram};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;
use tracing::{field, Span};

pub const TRACEPARENT_HEADER: &str = "traceparent";
pub const TRACESTATE_HEADER: &str = "tracestate";

const TRACE_VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelemetryConfig {
    /// Prefix of the service name reported on spans and metrics.
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

fn default_service_name() -> String {
    "pg-sql-replay".to_string()
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: default_service_name(),
        }
    }
}

/// W3C trace context for one hop of a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    trace_id: [u8; 16],
    span_id: [u8; 8],
    parent_span_id: Option<[u8; 8]>,
    flags: u8,
    trace_state: Option<String>,
}

impl TraceContext {
    fn root() -> Self {
        let mut rng = rand::thread_rng();
        let mut trace_id: [u8; 16] = rng.gen();
        while trace_id == [0; 16] {
            trace_id = rng.gen();
        }
        Self {
            trace_id,
            span_id: random_span_id(),
            parent_span_id: None,
            flags: FLAG_SAMPLED,
            trace_state: None,
        }
    }

    fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: random_span_id(),
            parent_span_id: Some(self.span_id),
            flags: self.flags,
            trace_state: self.trace_state.clone(),
        }
    }

    pub fn trace_id(&self) -> String {
        to_hex(&self.trace_id)
    }

    pub fn span_id(&self) -> String {
        to_hex(&self.span_id)
    }

    pub fn parent_span_id(&self) -> Option<String> {
        self.parent_span_id.as_ref().map(|id| to_hex(id))
    }

    pub fn is_sampled(&self) -> bool {
        self.flags & FLAG_SAMPLED != 0
    }

    pub fn traceparent(&self) -> String {
        format!(
            "{}-{}-{}-{:02x}",
            TRACE_VERSION,
            self.trace_id(),
            self.span_id(),
            self.flags
        )
    }

    /// Parses a `traceparent` header value.
    ///
    /// The span id of the header becomes this context's span id; callers
    /// continue the trace with [`Telemetry::continue_trace`].
    pub fn parse(traceparent: &str) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version.len() != 2 || version.eq_ignore_ascii_case("ff") {
            return None;
        }
        if version == TRACE_VERSION && parts.next().is_some() {
            return None;
        }

        let trace_id: [u8; 16] = from_hex(trace_id)?;
        let span_id: [u8; 8] = from_hex(span_id)?;
        let [flags]: [u8; 1] = from_hex(flags)?;

        if trace_id == [0; 16] || span_id == [0; 8] {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            parent_span_id: None,
            flags,
            trace_state: None,
        })
    }

    /// Extracts a context from message headers; `None` when absent or invalid.
    pub fn from_headers(headers: &HashMap<String, String>) -> Option<Self> {
        let mut ctx = Self::parse(headers.get(TRACEPARENT_HEADER)?)?;
        ctx.trace_state = headers
            .get(TRACESTATE_HEADER)
            .filter(|s| !s.trim().is_empty())
            .cloned();
        Some(ctx)
    }

    /// Header pairs to inject into an outgoing message.
    pub fn to_headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![(TRACEPARENT_HEADER.to_string(), self.traceparent())];
        if let Some(state) = &self.trace_state {
            headers.push((TRACESTATE_HEADER.to_string(), state.clone()));
        }
        headers
    }
}

fn random_span_id() -> [u8; 8] {
    let mut rng = rand::thread_rng();
    loop {
        let id: [u8; 8] = rng.gen();
        if id != [0; 8] {
            return id;
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn from_hex<const N: usize>(text: &str) -> Option<[u8; N]> {
    if text.len() != N * 2 || !text.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b)) {
        return None;
    }
    let mut out = [0u8; N];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&text[i * 2..i * 2 + 2], 16).ok()?;
    }
    Some(out)
}

/// Per-process telemetry handle.
#[derive(Clone)]
pub struct Telemetry {
    service_name: String,
    transactions_captured: Counter,
    changes_captured: Counter,
    publish_failures: Counter,
    messages_applied: Counter,
    messages_failed: Counter,
    messages_skipped: Counter,
    apply_duration: Histogram,
    replay_lag: Histogram,
}

impl Telemetry {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        let label = service_name.clone();
        Self {
            transactions_captured: counter!("cdc_transactions_captured_total", "service" => label.clone()),
            changes_captured: counter!("cdc_changes_captured_total", "service" => label.clone()),
            publish_failures: counter!("cdc_publish_failures_total", "service" => label.clone()),
            messages_applied: counter!("replay_messages_applied_total", "service" => label.clone()),
            messages_failed: counter!("replay_messages_failed_total", "service" => label.clone()),
            messages_skipped: counter!("replay_messages_skipped_total", "service" => label.clone()),
            apply_duration: histogram!("replay_apply_duration_seconds", "service" => label.clone()),
            replay_lag: histogram!("replay_lag_seconds", "service" => label),
            service_name,
        }
    }

    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    /// Starts a new trace for a captured transaction.
    pub fn start_trace(&self) -> TraceContext {
        TraceContext::root()
    }

    /// Continues a trace received from upstream as a child hop.
    pub fn continue_trace(&self, parent: &TraceContext) -> TraceContext {
        parent.child()
    }

    /// Span wrapping capture, rendering and publish of one transaction.
    pub fn pipeline_span(&self, ctx: &TraceContext, lsn: &str, changes: usize) -> Span {
        tracing::info_span!(
            "data.pipeline",
            otel.kind = "producer",
            service = %self.service_name,
            trace_id = %ctx.trace_id(),
            span_id = %ctx.span_id(),
            lsn = %lsn,
            changes = changes,
            otel.status_code = field::Empty,
            error = field::Empty,
        )
    }

    /// Span wrapping replay of one consumed message.
    pub fn message_span(&self, ctx: &TraceContext, topic: &str, partition: i32, offset: i64) -> Span {
        tracing::info_span!(
            "process-message",
            otel.kind = "consumer",
            service = %self.service_name,
            trace_id = %ctx.trace_id(),
            span_id = %ctx.span_id(),
            parent_span_id = %ctx.parent_span_id().unwrap_or_default(),
            kafka.topic = %topic,
            kafka.partition = partition,
            kafka.offset = offset,
            otel.status_code = field::Empty,
            error = field::Empty,
        )
    }

    pub fn record_captured(&self, changes: usize) {
        self.transactions_captured.increment(1);
        self.changes_captured.increment(changes as u64);
    }

    pub fn record_publish_failure(&self) {
        self.publish_failures.increment(1);
    }

    pub fn record_applied(&self, elapsed: Duration, lag: Option<Duration>) {
        self.messages_applied.increment(1);
        self.apply_duration.record(elapsed.as_secs_f64());
        if let Some(lag) = lag {
            self.replay_lag.record(lag.as_secs_f64());
        }
    }

    pub fn record_failed(&self) {
        self.messages_failed.increment(1);
    }

    pub fn record_skipped(&self) {
        self.messages_skipped.increment(1);
    }
}

/// Marks a span as successful.
pub fn mark_ok(span: &Span) {
    span.record("otel.status_code", "OK");
}

/// Marks a span as failed with the error text.
pub fn mark_error(span: &Span, error: &dyn std::fmt::Display) {
    span.record("otel.status_code", "ERROR");
    span.record("error", field::display(error));
}
