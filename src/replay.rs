//! Replay side: one executor per shard.
//!
//! Messages are handled strictly one after another in delivery order. A
//! message's offset is committed only once all of its statements have been
//! applied; a failure is logged, recorded on the message span and left
//! uncommitted, and the executor moves on to the next message.

use chrono::Utc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{error, info, info_span, warn, Instrument};

use crate::kafka::envelope::captured_at;
use crate::kafka::{InboundMessage, MessageSource, OffsetCommitter};
use crate::postgres::TargetDatabase;
use crate::sql::{ApplyPlan, SqlBatch};
use crate::telemetry::{mark_error, mark_ok, Telemetry, TraceContext};
use crate::{Error, Result};

const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

/// What happened to one consumed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// All statements applied and the offset committed.
    Applied,
    /// Applying or committing failed; the offset was not committed.
    Failed,
    /// Dropped without applying because it carried no headers.
    Skipped,
}

pub struct ReplayExecutor<D, C> {
    target: D,
    committer: C,
    telemetry: Telemetry,
    skip_without_trace_context: bool,
}

impl<D: TargetDatabase, C: OffsetCommitter> ReplayExecutor<D, C> {
    pub fn new(target: D, committer: C, telemetry: Telemetry, skip_without_trace_context: bool) -> Self {
        Self {
            target,
            committer,
            telemetry,
            skip_without_trace_context,
        }
    }

    /// Consumes messages until shutdown is signalled or the source ends.
    ///
    /// Shutdown is only observed between messages, so a message that has
    /// started applying always runs to completion or failure.
    pub async fn run<S: MessageSource>(&mut self, source: &S, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(service = %self.telemetry.service_name(), "Replay executor started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            let next = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                next = source.next_message() => next,
            };

            match next {
                Ok(Some(message)) => {
                    self.handle(message).await;
                }
                Ok(None) => {
                    info!("Message source exhausted");
                    break;
                }
                Err(e) => {
                    warn!("Failed to receive message: {}", e);
                    tokio::select! {
                        biased;
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => {}
                    }
                }
            }
        }

        info!("Replay executor stopped");
        Ok(())
    }

    /// Applies one message and commits its offset on success.
    pub async fn handle(&mut self, message: InboundMessage) -> MessageOutcome {
        let has_headers = message.headers.as_ref().is_some_and(|h| !h.is_empty());
        let parent = message.headers.as_ref().and_then(TraceContext::from_headers);
        let trace = match &parent {
            Some(parent) => self.telemetry.continue_trace(parent),
            None => self.telemetry.start_trace(),
        };
        let span = self
            .telemetry
            .message_span(&trace, &message.topic, message.partition, message.offset);

        if !has_headers && self.skip_without_trace_context {
            warn!(
                parent: &span,
                "Skipping message at {}/{} offset {} without headers",
                message.topic, message.partition, message.offset
            );
            self.telemetry.record_skipped();
            return MessageOutcome::Skipped;
        }
        if has_headers && parent.is_none() {
            warn!(
                parent: &span,
                "No usable trace context at {}/{} offset {}, starting a new trace",
                message.topic, message.partition, message.offset
            );
        }

        let started = Instant::now();
        let result = self.apply_and_commit(&message).instrument(span.clone()).await;

        match result {
            Ok(()) => {
                mark_ok(&span);
                let lag = message
                    .headers
                    .as_ref()
                    .and_then(captured_at)
                    .and_then(|at| (Utc::now() - at).to_std().ok());
                self.telemetry.record_applied(started.elapsed(), lag);
                info!(parent: &span, "Executed SQL: {}", message.payload_text());
                MessageOutcome::Applied
            }
            Err(e) => {
                mark_error(&span, &e);
                self.telemetry.record_failed();
                error!(
                    parent: &span,
                    error = %e,
                    "Failed to execute SQL: {}",
                    message.payload_text()
                );
                MessageOutcome::Failed
            }
        }
    }

    async fn apply_and_commit(&mut self, message: &InboundMessage) -> Result<()> {
        let payload = message.payload.as_deref().ok_or_else(|| Error::InvalidMessage {
            message: "Message has no payload".to_string(),
        })?;
        let batch = SqlBatch::decode(payload)?;

        match batch.plan() {
            ApplyPlan::Transactional(statements) => {
                self.target
                    .execute_transaction(statements)
                    .instrument(info_span!("db.transaction", statements = statements.len()))
                    .await?;
            }
            ApplyPlan::Standalone(statements) => {
                for statement in statements {
                    self.target
                        .execute(statement)
                        .instrument(info_span!("db.query", db.statement = %statement))
                        .await?;
                }
            }
        }

        self.committer
            .commit_offset(&message.topic, message.partition, message.offset)
            .await
    }

    pub fn into_parts(self) -> (D, C) {
        (self.target, self.committer)
    }
}
