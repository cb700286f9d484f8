//! Transactional outbox: durable domain events beside the state change.
//!
//! [`insert_event`] is the only write path and it borrows the caller's
//! transaction: if the business mutation commits the event is durable, if
//! it rolls back the event never existed. That single rule is what makes
//! the downstream pipeline reliable.
//!
//! The read/mark side used by the publisher sits behind [`OutboxStore`] so
//! the drain logic can be exercised against [`MemoryOutboxStore`] without a
//! database. Rows are totally ordered by `id`; publishers drain in `id`
//! ascending order and the row `key` partitions the downstream transport,
//! which together give per-key publication order.

use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, Transaction};

use crate::error::Result;

/// A domain event to record alongside a state change.
#[derive(Debug, Clone)]
pub struct NewOutboxEvent {
    /// Destination topic.
    pub topic: String,
    /// Partitioning key; preserves per-entity order downstream.
    pub key: String,
    /// Event type discriminator carried in the envelope.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
}

/// An unpublished row as seen by the publisher drain.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct OutboxRow {
    /// Monotonic row id; defines the total publication order.
    pub id: i64,
    /// Destination topic.
    pub topic: String,
    /// Partitioning key.
    pub key: String,
    /// Event type discriminator.
    pub event_type: String,
    /// Opaque JSON payload.
    pub payload: serde_json::Value,
}

/// Inserts one event row using the caller's transaction.
///
/// # Errors
///
/// Returns [`crate::Error::Database`] when the insert fails; the caller's
/// transaction should then be rolled back.
pub async fn insert_event(
    tx: &mut Transaction<'_, Postgres>,
    event: &NewOutboxEvent,
) -> Result<()> {
    sqlx::query(
        r"
        insert into outbox_events (topic, key, event_type, payload)
        values ($1, $2, $3, $4)
        ",
    )
    .bind(&event.topic)
    .bind(&event.key)
    .bind(&event.event_type)
    .bind(&event.payload)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Read/mark operations the publisher needs from the outbox table.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Returns up to `limit` unpublished rows in `id` ascending order.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxRow>>;

    /// Marks rows as published now and clears their last error.
    async fn mark_published(&self, ids: &[i64]) -> Result<()>;

    /// Increments the attempt counter and records the failure reason.
    async fn mark_failed(&self, ids: &[i64], reason: &str) -> Result<()>;
}

/// Postgres-backed outbox store.
#[derive(Debug, Clone)]
pub struct PgOutboxStore {
    pool: PgPool,
}

impl PgOutboxStore {
    /// Creates a store over the shared pool.
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PgOutboxStore {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query_as::<_, OutboxRow>(
            r"
            select id, topic, key, event_type, payload
            from outbox_events
            where published_at is null
            order by id
            limit $1
            ",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<()> {
        sqlx::query(
            r"
            update outbox_events
            set published_at = now(), last_error = null
            where id = any($1)
            ",
        )
        .bind(ids)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn mark_failed(&self, ids: &[i64], reason: &str) -> Result<()> {
        sqlx::query(
            r"
            update outbox_events
            set attempts = attempts + 1, last_error = $2
            where id = any($1)
            ",
        )
        .bind(ids)
        .bind(reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Full record kept by the in-memory store, including publication state.
#[derive(Debug, Clone)]
pub struct MemoryOutboxRecord {
    /// The drain view of the row.
    pub row: OutboxRow,
    /// When the row was marked published, if ever.
    pub published_at: Option<DateTime<Utc>>,
    /// Failed publication attempts so far.
    pub attempts: i32,
    /// Most recent failure reason.
    pub last_error: Option<String>,
}

/// In-memory outbox store intended for tests and dev.
///
/// Mirrors the table semantics: monotonic ids, `published_at` gating the
/// drain, attempt counting on failure.
#[derive(Debug, Default)]
pub struct MemoryOutboxStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: i64,
    records: Vec<MemoryOutboxRecord>,
}

impl MemoryOutboxStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends an event, assigning the next id. Test seam for the insert
    /// that production code performs inside a database transaction.
    pub fn push(&self, event: NewOutboxEvent) -> i64 {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.records.push(MemoryOutboxRecord {
            row: OutboxRow {
                id,
                topic: event.topic,
                key: event.key,
                event_type: event.event_type,
                payload: event.payload,
            },
            published_at: None,
            attempts: 0,
            last_error: None,
        });
        id
    }

    /// Clears the published mark on one row, simulating a crash between
    /// transport ack and the database update.
    pub fn forget_published(&self, id: i64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(record) = inner.records.iter_mut().find(|r| r.row.id == id) {
            record.published_at = None;
        }
    }

    /// Returns a snapshot of one record.
    #[must_use]
    pub fn record(&self, id: i64) -> Option<MemoryOutboxRecord> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.records.iter().find(|r| r.row.id == id).cloned()
    }

    /// Ids of rows currently marked published.
    #[must_use]
    pub fn published_ids(&self) -> Vec<i64> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner
            .records
            .iter()
            .filter(|r| r.published_at.is_some())
            .map(|r| r.row.id)
            .collect()
    }
}

#[async_trait]
impl OutboxStore for MemoryOutboxStore {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxRow>> {
        let inner = self.inner.lock().expect("lock poisoned");
        Ok(inner
            .records
            .iter()
            .filter(|r| r.published_at.is_none())
            .take(limit)
            .map(|r| r.row.clone())
            .collect())
    }

    async fn mark_published(&self, ids: &[i64]) -> Result<()> {
        let ids: HashSet<i64> = ids.iter().copied().collect();
        let mut inner = self.inner.lock().expect("lock poisoned");
        for record in &mut inner.records {
            if ids.contains(&record.row.id) {
                record.published_at = Some(Utc::now());
                record.last_error = None;
            }
        }
        Ok(())
    }

    async fn mark_failed(&self, ids: &[i64], reason: &str) -> Result<()> {
        let ids: HashSet<i64> = ids.iter().copied().collect();
        let mut inner = self.inner.lock().expect("lock poisoned");
        for record in &mut inner.records {
            if ids.contains(&record.row.id) {
                record.attempts += 1;
                record.last_error = Some(reason.to_string());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(key: &str) -> NewOutboxEvent {
        NewOutboxEvent {
            topic: "search-index".to_string(),
            key: key.to_string(),
            event_type: "pair.stats.recompute".to_string(),
            payload: json!({"pair_id": 42}),
        }
    }

    #[tokio::test]
    async fn test_memory_store_assigns_monotonic_ids() {
        let store = MemoryOutboxStore::new();
        let a = store.push(event("pair:1"));
        let b = store.push(event("pair:2"));
        assert!(b > a);

        let rows = store.fetch_unpublished(10).await.expect("fetch");
        assert_eq!(rows.len(), 2);
        assert!(rows[0].id < rows[1].id);
    }

    #[tokio::test]
    async fn test_published_rows_leave_the_drain() {
        let store = MemoryOutboxStore::new();
        let a = store.push(event("pair:1"));
        let b = store.push(event("pair:2"));

        store.mark_published(&[a]).await.expect("mark");
        let rows = store.fetch_unpublished(10).await.expect("fetch");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, b);
        assert_eq!(store.published_ids(), vec![a]);
    }

    #[tokio::test]
    async fn test_mark_failed_counts_attempts() {
        let store = MemoryOutboxStore::new();
        let id = store.push(event("pair:1"));

        store.mark_failed(&[id], "broker down").await.expect("mark");
        store.mark_failed(&[id], "still down").await.expect("mark");

        let record = store.record(id).expect("record");
        assert_eq!(record.attempts, 2);
        assert_eq!(record.last_error.as_deref(), Some("still down"));
        assert!(record.published_at.is_none());
    }
}
