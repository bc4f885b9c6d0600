//! Transactional outbox.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, OrderId};
use serde::{Deserialize, Serialize};
use store::{Result, StoreError};

use crate::events::DomainEvent;

/// Delivery state of an outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    /// Awaiting delivery (or redelivery after a handler failure).
    Pending,
    /// Every handler processed it.
    Published,
    /// Dead letter: delivery kept failing past the retry budget.
    Failed,
}

/// One event awaiting delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub event_id: EventId,
    pub aggregate_type: String,
    pub aggregate_id: OrderId,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub status: OutboxStatus,
    pub retry_count: u32,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Wraps a domain event into a PENDING record.
    pub fn new(event: &DomainEvent) -> Result<Self> {
        Ok(Self {
            event_id: EventId::new(),
            aggregate_type: "order".to_string(),
            aggregate_id: event.order_id(),
            event_type: event.event_type().to_string(),
            payload: serde_json::to_value(event)?,
            status: OutboxStatus::Pending,
            retry_count: 0,
            error_message: None,
            created_at: Utc::now(),
            published_at: None,
        })
    }

    /// Deserializes the payload back into the domain event.
    pub fn decode(&self) -> Result<DomainEvent> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Durable storage for outbox records. `append` enforces `event_id`
/// uniqueness so a retried producer cannot double-append.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn append(&self, record: &OutboxRecord) -> Result<()>;
    /// Up to `limit` PENDING records in creation order.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>>;
    async fn mark_published(&self, event_id: EventId) -> Result<()>;
    /// Bumps the retry counter, keeping the record PENDING. Returns the new
    /// count.
    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<u32>;
    /// Parks the record as a dead letter.
    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()>;
}

/// Appends domain events to the outbox.
///
/// Cheap to clone; clones share the underlying store.
#[derive(Clone)]
pub struct EventPublisher {
    outbox: Arc<dyn OutboxStore>,
}

impl EventPublisher {
    pub fn new(outbox: Arc<dyn OutboxStore>) -> Self {
        Self { outbox }
    }

    /// Appends `event` as a PENDING record.
    pub async fn publish(&self, event: &DomainEvent) -> Result<EventId> {
        let record = OutboxRecord::new(event)?;
        self.outbox.append(&record).await?;
        tracing::debug!(
            event_id = %record.event_id,
            event_type = record.event_type,
            order_id = %record.aggregate_id,
            "event appended to outbox"
        );
        Ok(record.event_id)
    }
}

/// In-memory [`OutboxStore`].
#[derive(Clone, Default)]
pub struct InMemoryOutboxStore {
    records: Arc<RwLock<Vec<OutboxRecord>>>,
}

impl InMemoryOutboxStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record, in creation order. Test visibility.
    pub fn all(&self) -> Vec<OutboxRecord> {
        self.records.read().unwrap().clone()
    }

    fn update<F, T>(&self, event_id: EventId, f: F) -> Result<T>
    where
        F: FnOnce(&mut OutboxRecord) -> T,
    {
        let mut records = self.records.write().unwrap();
        let record = records
            .iter_mut()
            .find(|r| r.event_id == event_id)
            .ok_or_else(|| StoreError::NotFound {
                entity: "outbox_record",
                id: event_id.to_string(),
            })?;
        Ok(f(record))
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn append(&self, record: &OutboxRecord) -> Result<()> {
        let mut records = self.records.write().unwrap();
        if records.iter().any(|r| r.event_id == record.event_id) {
            return Err(StoreError::UniqueViolation {
                entity: "outbox_record",
                detail: format!("event {} already appended", record.event_id),
            });
        }
        records.push(record.clone());
        Ok(())
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        Ok(self
            .records
            .read()
            .unwrap()
            .iter()
            .filter(|r| r.status == OutboxStatus::Pending)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        self.update(event_id, |r| {
            r.status = OutboxStatus::Published;
            r.published_at = Some(Utc::now());
        })
    }

    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<u32> {
        self.update(event_id, |r| {
            r.retry_count += 1;
            r.error_message = Some(error.to_string());
            r.retry_count
        })
    }

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()> {
        self.update(event_id, |r| {
            r.status = OutboxStatus::Failed;
            r.error_message = Some(error.to_string());
        })
    }
}
