//! Capture side: replication slot to Kafka.
//!
//! One sequential loop per process. Each transaction is decoded, rendered,
//! published and only then acknowledged to the slot. Any failure along the
//! way stops the loop with an error, leaving the slot positioned before the
//! failed transaction so that a restart picks it up again.

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

use crate::kafka::{BatchPublisher, Envelope, KeyStrategy};
use crate::postgres::{ChangeSource, Lsn, Wal2JsonDecoder};
use crate::sql::{batch_transaction, SqlSerializer};
use crate::telemetry::{mark_error, mark_ok, Telemetry};
use crate::Result;

pub struct CaptureService<S, P> {
    source: S,
    publisher: P,
    serializer: SqlSerializer,
    key_strategy: KeyStrategy,
    topic: String,
    poll_interval: Duration,
    telemetry: Telemetry,
}

impl<S: ChangeSource, P: BatchPublisher> CaptureService<S, P> {
    pub fn new(
        source: S,
        publisher: P,
        serializer: SqlSerializer,
        key_strategy: KeyStrategy,
        topic: String,
        poll_interval: Duration,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            source,
            publisher,
            serializer,
            key_strategy,
            topic,
            poll_interval,
            telemetry,
        }
    }

    /// Runs until shutdown is signalled or a transaction cannot be published.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!(topic = %self.topic, "Capture started");

        'outer: loop {
            if *shutdown.borrow() {
                break;
            }

            let pending = self.source.poll().await?;
            let idle = pending.is_empty();

            for (lsn, document) in pending {
                self.process_transaction(lsn, &document).await?;
                if *shutdown.borrow() {
                    break 'outer;
                }
            }

            if idle {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(self.poll_interval) => {}
                }
            }
        }

        info!("Capture stopped");
        Ok(())
    }

    /// Publishes one transaction and acknowledges it to the source.
    pub async fn process_transaction(&mut self, lsn: Lsn, document: &str) -> Result<()> {
        let transaction = Wal2JsonDecoder::decode(lsn, document)?;

        if transaction.is_empty() {
            debug!(lsn = %lsn, "Skipping empty transaction");
            return self.source.acknowledge(lsn).await;
        }

        let changes = transaction.changes.len();
        let trace = self.telemetry.start_trace();
        let span = self.telemetry.pipeline_span(&trace, &lsn.to_string(), changes);

        let result = async {
            let batch = batch_transaction(&self.serializer, &transaction)?;
            let envelope = Envelope::build(&transaction, &batch, &trace, &self.key_strategy)?;

            if let Err(e) = self.publisher.publish(&self.topic, &envelope).await {
                self.telemetry.record_publish_failure();
                error!("[{}] Failed to send to Kafka, stopping replication: {}", lsn, e);
                return Err(e);
            }

            self.source.acknowledge(lsn).await?;
            self.telemetry.record_captured(changes);
            info!("[{}] Replicated transaction with {} changes.", lsn, changes);
            Ok(())
        }
        .instrument(span.clone())
        .await;

        match &result {
            Ok(()) => mark_ok(&span),
            Err(e) => mark_error(&span, e),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kafka::envelope::LSN_HEADER;
    use crate::sql::SqlBatch;
    use crate::telemetry::TRACEPARENT_HEADER;
    use crate::Error;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct FakeSource {
        pending: VecDeque<Vec<(Lsn, String)>>,
        acknowledged: Arc<Mutex<Vec<Lsn>>>,
    }

    #[async_trait]
    impl ChangeSource for FakeSource {
        async fn poll(&mut self) -> Result<Vec<(Lsn, String)>> {
            Ok(self.pending.pop_front().unwrap_or_default())
        }

        async fn acknowledge(&mut self, lsn: Lsn) -> Result<()> {
            self.acknowledged.lock().unwrap().push(lsn);
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakePublisher {
        sent: Arc<Mutex<Vec<(String, Envelope)>>>,
        fail_on_call: Option<usize>,
    }

    #[async_trait]
    impl BatchPublisher for FakePublisher {
        async fn publish(&self, topic: &str, envelope: &Envelope) -> Result<(i32, i64)> {
            let mut sent = self.sent.lock().unwrap();
            if self.fail_on_call == Some(sent.len()) {
                return Err(Error::PublishFailure {
                    topic: topic.to_string(),
                    source: rdkafka::error::KafkaError::Canceled,
                });
            }
            sent.push((topic.to_string(), envelope.clone()));
            Ok((0, sent.len() as i64 - 1))
        }
    }

    fn insert_doc(table: &str, id: i64) -> serde_json::Value {
        json!({
            "kind": "insert", "schema": "public", "table": table,
            "columnnames": ["id"], "columntypes": ["integer"], "columnvalues": [id]
        })
    }

    fn tx_doc(changes: Vec<serde_json::Value>) -> String {
        json!({ "xid": 700, "change": changes }).to_string()
    }

    fn service(
        source: FakeSource,
        publisher: FakePublisher,
    ) -> CaptureService<FakeSource, FakePublisher> {
        CaptureService::new(
            source,
            publisher,
            SqlSerializer::default(),
            KeyStrategy::None,
            "sql-topic".to_string(),
            Duration::from_millis(5),
            Telemetry::new("capture-test"),
        )
    }

    #[tokio::test]
    async fn test_publishes_then_acknowledges() {
        let source = FakeSource::default();
        let acknowledged = source.acknowledged.clone();
        let publisher = FakePublisher::default();
        let sent = publisher.sent.clone();
        let mut capture = service(source, publisher);

        let doc = tx_doc(vec![insert_doc("users", 1), insert_doc("users", 2)]);
        capture.process_transaction(Lsn(10), &doc).await.unwrap();

        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        let (topic, envelope) = &sent[0];
        assert_eq!(topic, "sql-topic");

        let batch = SqlBatch::decode(&envelope.payload).unwrap();
        assert_eq!(batch.len(), 4);
        assert_eq!(batch.statements()[0], "BEGIN;");

        let headers: HashMap<String, String> = envelope.headers.iter().cloned().collect();
        assert!(headers.contains_key(TRACEPARENT_HEADER));
        assert_eq!(headers.get(LSN_HEADER).map(String::as_str), Some("0/A"));

        assert_eq!(*acknowledged.lock().unwrap(), vec![Lsn(10)]);
    }

    #[tokio::test]
    async fn test_empty_transaction_is_acknowledged_not_published() {
        let source = FakeSource::default();
        let acknowledged = source.acknowledged.clone();
        let publisher = FakePublisher::default();
        let sent = publisher.sent.clone();
        let mut capture = service(source, publisher);

        capture.process_transaction(Lsn(5), &tx_doc(vec![])).await.unwrap();

        assert!(sent.lock().unwrap().is_empty());
        assert_eq!(*acknowledged.lock().unwrap(), vec![Lsn(5)]);
    }

    #[tokio::test]
    async fn test_publish_failure_is_fatal_and_not_acknowledged() {
        let mut source = FakeSource::default();
        source.pending.push_back(vec![
            (Lsn(1), tx_doc(vec![insert_doc("a", 1)])),
            (Lsn(2), tx_doc(vec![insert_doc("b", 2)])),
            (Lsn(3), tx_doc(vec![insert_doc("c", 3)])),
        ]);
        let acknowledged = source.acknowledged.clone();
        let publisher = FakePublisher {
            fail_on_call: Some(1),
            ..Default::default()
        };
        let sent = publisher.sent.clone();
        let mut capture = service(source, publisher);

        let (_tx, rx) = watch::channel(false);
        let err = capture.run(rx).await.unwrap_err();

        assert!(matches!(err, Error::PublishFailure { .. }));
        assert!(err.is_fatal());
        assert_eq!(sent.lock().unwrap().len(), 1);
        assert_eq!(*acknowledged.lock().unwrap(), vec![Lsn(1)]);
    }

    #[tokio::test]
    async fn test_unsupported_kind_stops_capture() {
        let mut source = FakeSource::default();
        source.pending.push_back(vec![(
            Lsn(9),
            tx_doc(vec![json!({"kind": "truncate", "schema": "public", "table": "t"})]),
        )]);
        let acknowledged = source.acknowledged.clone();
        let mut capture = service(source, FakePublisher::default());

        let (_tx, rx) = watch::channel(false);
        let err = capture.run(rx).await.unwrap_err();

        assert!(matches!(err, Error::UnsupportedChangeKind { .. }));
        assert!(acknowledged.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let mut source = FakeSource::default();
        source.pending.push_back(vec![(Lsn(1), tx_doc(vec![insert_doc("a", 1)]))]);
        let publisher = FakePublisher::default();
        let sent = publisher.sent.clone();
        let mut capture = service(source, publisher);

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn(async move { capture.run(rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("capture did not stop")
            .unwrap();
        assert!(result.is_ok());
        assert_eq!(sent.lock().unwrap().len(), 1);
    }
}
