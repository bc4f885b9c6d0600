//! PostgreSQL-backed order and outbox repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{EventId, Money, OrderId, UserId, Version};
use sqlx::{PgPool, Row, postgres::PgRow};
use store::{Result, StoreError};
use uuid::Uuid;

use crate::order::{Order, OrderStatus, OrderStore};
use crate::outbox::{OutboxRecord, OutboxStatus, OutboxStore};

/// PostgreSQL [`OrderStore`] with version-stamped saves.
#[derive(Clone)]
pub struct PostgresOrderStore {
    pool: PgPool,
}

impl PostgresOrderStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        let status = match row.try_get::<&str, _>("status")? {
            "PENDING" => OrderStatus::Pending,
            "AWAITING_PAYMENT" => OrderStatus::AwaitingPayment,
            "PAYMENT_COMPLETED" => OrderStatus::PaymentCompleted,
            "CANCELLED" => OrderStatus::Cancelled,
            other => {
                return Err(StoreError::Backend(format!("corrupt order status: {other}")));
            }
        };

        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            status,
            total: Money::from_cents(row.try_get("total_amount")?),
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
            version: Version::new(row.try_get("version")?),
        })
    }
}

#[async_trait]
impl OrderStore for PostgresOrderStore {
    async fn save(&self, order: &Order) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO orders (id, user_id, status, total_amount, created_at, updated_at, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                updated_at = EXCLUDED.updated_at,
                version = EXCLUDED.version
            WHERE orders.version = $8
            "#,
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.status.to_string())
        .bind(order.total.cents())
        .bind(order.created_at)
        .bind(order.updated_at)
        .bind(order.version.next().as_i64())
        .bind(order.version.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual: i64 = sqlx::query_scalar("SELECT version FROM orders WHERE id = $1")
                .bind(order.id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
            return Err(StoreError::VersionConflict {
                entity: "order",
                id: order.id.to_string(),
                expected: order.version,
                actual: Version::new(actual),
            });
        }
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, status, total_amount, created_at, updated_at, version
            FROM orders
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_order).transpose()
    }
}

/// PostgreSQL [`OutboxStore`]. The `event_id` primary key enforces
/// append-once.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        let status = match row.try_get::<&str, _>("status")? {
            "PENDING" => OutboxStatus::Pending,
            "PUBLISHED" => OutboxStatus::Published,
            "FAILED" => OutboxStatus::Failed,
            other => {
                return Err(StoreError::Backend(format!(
                    "corrupt outbox status: {other}"
                )));
            }
        };

        Ok(OutboxRecord {
            event_id: EventId::from_uuid(row.try_get::<Uuid, _>("event_id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: OrderId::from_uuid(row.try_get::<Uuid, _>("aggregate_id")?),
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            status,
            retry_count: row.try_get::<i32, _>("retry_count")? as u32,
            error_message: row.try_get("error_message")?,
            created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
            published_at: row.try_get("published_at")?,
        })
    }

    fn status_str(status: OutboxStatus) -> &'static str {
        match status {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Published => "PUBLISHED",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn append(&self, record: &OutboxRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO outbox
                (event_id, aggregate_type, aggregate_id, event_type, payload,
                 status, retry_count, error_message, created_at, published_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(record.event_id.as_uuid())
        .bind(&record.aggregate_type)
        .bind(record.aggregate_id.as_uuid())
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(Self::status_str(record.status))
        .bind(record.retry_count as i32)
        .bind(&record.error_message)
        .bind(record.created_at)
        .bind(record.published_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.constraint() == Some("outbox_pkey") => {
                StoreError::UniqueViolation {
                    entity: "outbox_record",
                    detail: format!("event {} already appended", record.event_id),
                }
            }
            _ => StoreError::Database(e),
        })?;
        Ok(())
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, aggregate_type, aggregate_id, event_type, payload,
                   status, retry_count, error_message, created_at, published_at
            FROM outbox
            WHERE status = 'PENDING'
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_record).collect()
    }

    async fn mark_published(&self, event_id: EventId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox SET status = 'PUBLISHED', published_at = $2
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn record_failure(&self, event_id: EventId, error: &str) -> Result<u32> {
        let retries: i32 = sqlx::query_scalar(
            r#"
            UPDATE outbox SET retry_count = retry_count + 1, error_message = $2
            WHERE event_id = $1
            RETURNING retry_count
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .fetch_one(&self.pool)
        .await?;
        Ok(retries as u32)
    }

    async fn mark_failed(&self, event_id: EventId, error: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox SET status = 'FAILED', error_message = $2
            WHERE event_id = $1
            "#,
        )
        .bind(event_id.as_uuid())
        .bind(error)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
