//! Outbox publisher: drains unpublished rows to the downstream queue.
//!
//! ```text
//! outbox table ──fetch (id asc)──▶ Publisher ──envelope──▶ transport ──▶ queue
//!      ▲                              │
//!      └── mark published / failed ◀──┘
//! ```
//!
//! # Delivery semantics
//!
//! **At-least-once.** Rows are marked published only after the transport
//! acknowledged them; a crash between send and mark re-emits the row on
//! recovery, so consumers must be idempotent. **Per-key order** holds
//! because rows drain in `id` ascending order and the transport partitions
//! by the row key.
//!
//! Two deployment shapes share the same drain:
//!
//! - [`Publisher::run`]: long-lived background task, ticking until its
//!   cancellation scope ends (server mode)
//! - [`Publisher::drain_until`]: bounded loop with a wall-clock limit,
//!   returning the number of rows sent (scheduled-invocation mode)

use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::outbox::{OutboxRow, OutboxStore};

/// Default rows fetched per drain.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default pause between drains.
pub const DEFAULT_TICK: Duration = Duration::from_millis(300);

// Transport-imposed cap on one send call.
const SEND_CHUNK: usize = 10;

/// The wire envelope wrapped around every outbox payload.
#[derive(Debug, Serialize)]
pub struct Envelope<'a> {
    /// Event type discriminator.
    pub event_type: &'a str,
    /// Opaque JSON payload.
    pub payload: &'a serde_json::Value,
}

/// One message handed to the queue transport.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    /// Destination topic.
    pub topic: String,
    /// Partitioning key.
    pub key: String,
    /// Encoded envelope bytes.
    pub payload: Vec<u8>,
}

/// Downstream queue transport.
///
/// `send_batch` reports one outcome per message, index-aligned with the
/// input, so the publisher can mark acked and rejected rows independently.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Sends a batch of at most ten messages, returning per-message
    /// outcomes.
    async fn send_batch(&self, messages: &[QueueMessage]) -> Vec<Result<()>>;
}

#[async_trait]
impl<T: EventTransport> EventTransport for std::sync::Arc<T> {
    async fn send_batch(&self, messages: &[QueueMessage]) -> Vec<Result<()>> {
        self.as_ref().send_batch(messages).await
    }
}

#[async_trait]
impl<S: OutboxStore> OutboxStore for std::sync::Arc<S> {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        self.as_ref().fetch_unpublished(limit).await
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<()> {
        self.as_ref().mark_published(ids).await
    }

    async fn mark_failed(&self, ids: &[i64], reason: &str) -> Result<()> {
        self.as_ref().mark_failed(ids, reason).await
    }
}

/// Drains the outbox to a queue transport.
pub struct Publisher<S, T> {
    store: S,
    transport: T,
    batch_size: usize,
    tick: Duration,
}

impl<S, T> Publisher<S, T>
where
    S: OutboxStore,
    T: EventTransport,
{
    /// Creates a publisher with default batch size and tick.
    #[must_use]
    pub fn new(store: S, transport: T) -> Self {
        Self {
            store,
            transport,
            batch_size: DEFAULT_BATCH_SIZE,
            tick: DEFAULT_TICK,
        }
    }

    /// Overrides the per-drain batch size.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Overrides the tick interval.
    #[must_use]
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Runs until the cancellation scope ends.
    ///
    /// Per-tick errors are logged and the loop continues; a transient
    /// broker or database failure must never kill the pipeline. While full
    /// batches keep succeeding the next drain starts immediately.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            loop {
                match self.publish_once().await {
                    // Full batch sent: more rows are likely waiting.
                    Ok(sent) if sent == self.batch_size => {}
                    Ok(_) => break,
                    Err(error) => {
                        tracing::warn!(error = %error, "outbox publish error");
                        break;
                    }
                }
                if cancel.is_cancelled() {
                    break;
                }
            }
        }

        tracing::info!("outbox publisher stopped");
    }

    /// Drains repeatedly until the outbox is empty or the deadline passes,
    /// returning the number of rows sent.
    ///
    /// # Errors
    ///
    /// Returns the first drain error; rows already acknowledged stay marked
    /// published, so a retried invocation reprocesses only the remainder.
    pub async fn drain_until(&self, deadline: Instant) -> Result<usize> {
        let mut total = 0;
        while Instant::now() < deadline {
            let sent = self.publish_once().await?;
            total += sent;
            if sent < self.batch_size {
                break;
            }
        }
        Ok(total)
    }

    /// Performs one drain: fetch, envelope, send, mark.
    ///
    /// Returns the number of rows acknowledged by the transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the store fails or when any message in the
    /// batch was rejected; acknowledged siblings are already marked
    /// published at that point.
    pub async fn publish_once(&self) -> Result<usize> {
        let rows = self.store.fetch_unpublished(self.batch_size).await?;
        if rows.is_empty() {
            return Ok(0);
        }

        let mut ok_ids: Vec<i64> = Vec::new();
        let mut failed_ids: Vec<i64> = Vec::new();
        let mut failure_reason = String::new();

        let mut encoded: Vec<(i64, QueueMessage)> = Vec::with_capacity(rows.len());
        for row in &rows {
            match encode_message(row) {
                Ok(message) => encoded.push((row.id, message)),
                Err(error) => {
                    // A row that cannot be enveloped would poison every
                    // retry; record the failure and move on.
                    self.store
                        .mark_failed(&[row.id], &format!("encode envelope: {error}"))
                        .await?;
                }
            }
        }

        for chunk in encoded.chunks(SEND_CHUNK) {
            let messages: Vec<QueueMessage> = chunk.iter().map(|(_, m)| m.clone()).collect();
            let outcomes = self.transport.send_batch(&messages).await;

            for ((id, message), outcome) in chunk.iter().zip(outcomes) {
                match outcome {
                    Ok(()) => ok_ids.push(*id),
                    Err(error) => {
                        tracing::warn!(
                            id = *id,
                            key = %message.key,
                            error = %error,
                            "queue send rejected"
                        );
                        failure_reason = error.to_string();
                        failed_ids.push(*id);
                    }
                }
            }
        }

        if !ok_ids.is_empty() {
            self.store.mark_published(&ok_ids).await?;
        }
        if !failed_ids.is_empty() {
            self.store.mark_failed(&failed_ids, &failure_reason).await?;
            return Err(Error::transport(format!(
                "{} of {} messages failed: {failure_reason}",
                failed_ids.len(),
                rows.len()
            )));
        }

        Ok(ok_ids.len())
    }
}

fn encode_message(row: &OutboxRow) -> Result<QueueMessage> {
    let payload = serde_json::to_vec(&Envelope {
        event_type: &row.event_type,
        payload: &row.payload,
    })?;
    Ok(QueueMessage {
        topic: row.topic.clone(),
        key: row.key.clone(),
        payload,
    })
}

// ============================================================================
// Kafka transport
// ============================================================================

/// Kafka-backed transport.
///
/// Keyed records hash onto partitions, which gives the per-key ordering the
/// outbox contract relies on; `acks=all` makes the broker acknowledgement
/// durable.
pub struct KafkaTransport {
    producer: rdkafka::producer::FutureProducer,
}

impl KafkaTransport {
    /// Creates a producer for the given brokers.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Transport`] when the producer cannot be created.
    pub fn new(brokers: &[String]) -> Result<Self> {
        let producer = rdkafka::ClientConfig::new()
            .set("bootstrap.servers", brokers.join(","))
            .set("acks", "all")
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| Error::transport(format!("create kafka producer: {e}")))?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl EventTransport for KafkaTransport {
    async fn send_batch(&self, messages: &[QueueMessage]) -> Vec<Result<()>> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            let record = rdkafka::producer::FutureRecord::to(&message.topic)
                .key(&message.key)
                .payload(&message.payload);
            let outcome = self
                .producer
                .send(record, Duration::from_secs(10))
                .await
                .map(|_| ())
                .map_err(|(error, _)| Error::transport(error.to_string()));
            outcomes.push(outcome);
        }
        outcomes
    }
}

// ============================================================================
// In-memory transport
// ============================================================================

/// In-memory transport intended for tests and dev.
///
/// Records every acknowledged message and can be told to reject messages
/// for specific keys.
#[derive(Debug, Default)]
pub struct MemoryTransport {
    sent: Mutex<Vec<QueueMessage>>,
    failing_keys: Mutex<HashSet<String>>,
}

impl MemoryTransport {
    /// Creates an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rejects every subsequent message carrying `key`.
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys
            .lock()
            .expect("lock poisoned")
            .insert(key.into());
    }

    /// Stops rejecting messages.
    pub fn clear_failures(&self) {
        self.failing_keys.lock().expect("lock poisoned").clear();
    }

    /// Snapshot of acknowledged messages in send order.
    #[must_use]
    pub fn sent(&self) -> Vec<QueueMessage> {
        self.sent.lock().expect("lock poisoned").clone()
    }

    /// Keys of acknowledged messages in send order.
    #[must_use]
    pub fn sent_keys(&self) -> Vec<String> {
        self.sent
            .lock()
            .expect("lock poisoned")
            .iter()
            .map(|m| m.key.clone())
            .collect()
    }
}

#[async_trait]
impl EventTransport for MemoryTransport {
    async fn send_batch(&self, messages: &[QueueMessage]) -> Vec<Result<()>> {
        let failing = self.failing_keys.lock().expect("lock poisoned").clone();
        messages
            .iter()
            .map(|message| {
                if failing.contains(&message.key) {
                    Err(Error::transport(format!("rejected key {}", message.key)))
                } else {
                    self.sent
                        .lock()
                        .expect("lock poisoned")
                        .push(message.clone());
                    Ok(())
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::outbox::{MemoryOutboxStore, NewOutboxEvent};

    fn event(key: &str, pair_id: i64) -> NewOutboxEvent {
        NewOutboxEvent {
            topic: "search-index".to_string(),
            key: key.to_string(),
            event_type: "pair.stats.recompute".to_string(),
            payload: json!({"pair_id": pair_id}),
        }
    }

    fn publisher(
        store: Arc<MemoryOutboxStore>,
        transport: Arc<MemoryTransport>,
    ) -> Publisher<Arc<MemoryOutboxStore>, Arc<MemoryTransport>> {
        Publisher::new(store, transport).with_tick(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_per_key_order_preserved() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());

        store.push(event("k1", 1));
        store.push(event("k1", 2));
        store.push(event("k2", 3));

        let publisher = publisher(Arc::clone(&store), Arc::clone(&transport));
        let sent = publisher.publish_once().await.expect("publish");
        assert_eq!(sent, 3);

        let keys = transport.sent_keys();
        let k1_positions: Vec<usize> = keys
            .iter()
            .enumerate()
            .filter(|(_, k)| k.as_str() == "k1")
            .map(|(i, _)| i)
            .collect();
        assert_eq!(k1_positions.len(), 2);
        assert!(k1_positions[0] < k1_positions[1]);

        let payloads: Vec<serde_json::Value> = transport
            .sent()
            .iter()
            .filter(|m| m.key == "k1")
            .map(|m| serde_json::from_slice(&m.payload).expect("envelope json"))
            .collect();
        assert_eq!(payloads[0]["payload"]["pair_id"], 1);
        assert_eq!(payloads[1]["payload"]["pair_id"], 2);

        assert_eq!(store.published_ids().len(), 3);
    }

    #[tokio::test]
    async fn test_ack_then_crash_reemits_row() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());

        let id = store.push(event("k1", 1));
        let publisher = publisher(Arc::clone(&store), Arc::clone(&transport));
        publisher.publish_once().await.expect("publish");
        assert_eq!(transport.sent().len(), 1);

        // Crash between transport ack and the published mark: the row is
        // unmarked again and the next drain re-sends it.
        store.forget_published(id);
        publisher.publish_once().await.expect("publish");

        assert_eq!(transport.sent().len(), 2, "duplicate on the wire");
        assert_eq!(store.published_ids(), vec![id]);
    }

    #[tokio::test]
    async fn test_partial_failure_marks_attempts_and_errors() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());

        let ok_id = store.push(event("good", 1));
        let bad_id = store.push(event("bad", 2));
        transport.fail_key("bad");

        let publisher = publisher(Arc::clone(&store), Arc::clone(&transport));
        let error = publisher.publish_once().await.expect_err("batch failed");
        assert!(matches!(error, Error::Transport { .. }));

        assert_eq!(store.published_ids(), vec![ok_id]);
        let bad = store.record(bad_id).expect("record");
        assert_eq!(bad.attempts, 1);
        assert!(bad.last_error.as_deref().unwrap_or("").contains("bad"));

        // Broker recovers: the retried drain only reprocesses the failure.
        transport.clear_failures();
        let sent = publisher.publish_once().await.expect("retry");
        assert_eq!(sent, 1);
        assert_eq!(store.published_ids(), vec![ok_id, bad_id]);
        let bad = store.record(bad_id).expect("record");
        assert!(bad.last_error.is_none());
    }

    #[tokio::test]
    async fn test_drain_until_returns_sent_count() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());
        for i in 0..25 {
            store.push(event(&format!("k{i}"), i));
        }

        let publisher =
            Publisher::new(Arc::clone(&store), Arc::clone(&transport)).with_batch_size(10);
        let deadline = Instant::now() + Duration::from_secs(5);
        let sent = publisher.drain_until(deadline).await.expect("drain");

        assert_eq!(sent, 25);
        assert_eq!(store.published_ids().len(), 25);
        assert_eq!(
            publisher.drain_until(Instant::now() + Duration::from_secs(1)).await.expect("empty"),
            0
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancellation() {
        let store = Arc::new(MemoryOutboxStore::new());
        let transport = Arc::new(MemoryTransport::new());
        store.push(event("k1", 1));

        let publisher = publisher(Arc::clone(&store), Arc::clone(&transport));
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { publisher.run(cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        task.await.expect("publisher task joins");

        assert_eq!(store.published_ids().len(), 1);
    }
}
