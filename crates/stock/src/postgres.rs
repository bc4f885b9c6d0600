//! PostgreSQL-backed stock repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId, Version};
use sqlx::{PgPool, Row, postgres::PgRow};
use store::{Result, StoreError};
use uuid::Uuid;

use crate::product_stock::ProductStock;
use crate::reservation::{ReservationStatus, StockReservation};
use crate::store_api::{ProductStockStore, StockReservationStore};

/// PostgreSQL [`ProductStockStore`] with version-stamped saves.
#[derive(Clone)]
pub struct PostgresProductStockStore {
    pool: PgPool,
}

impl PostgresProductStockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_stock(row: PgRow) -> Result<ProductStock> {
        Ok(ProductStock {
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            current: row.try_get::<i32, _>("current_quantity")? as u32,
            reserved: row.try_get::<i32, _>("reserved_quantity")? as u32,
            version: Version::new(row.try_get("version")?),
        })
    }
}

#[async_trait]
impl ProductStockStore for PostgresProductStockStore {
    async fn save(&self, stock: &ProductStock) -> Result<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO product_stocks (product_id, current_quantity, reserved_quantity, version)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (product_id) DO UPDATE SET
                current_quantity = EXCLUDED.current_quantity,
                reserved_quantity = EXCLUDED.reserved_quantity,
                version = EXCLUDED.version
            WHERE product_stocks.version = $5
            "#,
        )
        .bind(stock.product_id.as_uuid())
        .bind(stock.current as i32)
        .bind(stock.reserved as i32)
        .bind(stock.version.next().as_i64())
        .bind(stock.version.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual: i64 =
                sqlx::query_scalar("SELECT version FROM product_stocks WHERE product_id = $1")
                    .bind(stock.product_id.as_uuid())
                    .fetch_one(&self.pool)
                    .await?;
            return Err(StoreError::VersionConflict {
                entity: "product_stock",
                id: stock.product_id.to_string(),
                expected: stock.version,
                actual: Version::new(actual),
            });
        }
        Ok(())
    }

    async fn find_by_product(&self, product_id: ProductId) -> Result<Option<ProductStock>> {
        let row = sqlx::query(
            r#"
            SELECT product_id, current_quantity, reserved_quantity, version
            FROM product_stocks
            WHERE product_id = $1
            "#,
        )
        .bind(product_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_stock).transpose()
    }
}

/// PostgreSQL [`StockReservationStore`].
#[derive(Clone)]
pub struct PostgresStockReservationStore {
    pool: PgPool,
}

impl PostgresStockReservationStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_reservation(row: PgRow) -> Result<StockReservation> {
        let status = match row.try_get::<&str, _>("status")? {
            "RESERVED" => ReservationStatus::Reserved,
            "CONFIRMED" => ReservationStatus::Confirmed,
            "RELEASED" => ReservationStatus::Released,
            other => {
                return Err(StoreError::Backend(format!(
                    "corrupt reservation status: {other}"
                )));
            }
        };

        Ok(StockReservation {
            id: ReservationId::from_uuid(row.try_get::<Uuid, _>("id")?),
            order_id: OrderId::from_uuid(row.try_get::<Uuid, _>("order_id")?),
            product_id: ProductId::from_uuid(row.try_get::<Uuid, _>("product_id")?),
            quantity: row.try_get::<i32, _>("quantity")? as u32,
            status,
            reserved_at: row.try_get::<DateTime<Utc>, _>("reserved_at")?,
            expires_at: row.try_get::<DateTime<Utc>, _>("expires_at")?,
            confirmed_at: row.try_get("confirmed_at")?,
        })
    }

    fn status_str(status: ReservationStatus) -> &'static str {
        match status {
            ReservationStatus::Reserved => "RESERVED",
            ReservationStatus::Confirmed => "CONFIRMED",
            ReservationStatus::Released => "RELEASED",
        }
    }

    async fn fetch_many(&self, sql: &str, order_id: Option<OrderId>) -> Result<Vec<StockReservation>> {
        let mut query = sqlx::query(sql);
        if let Some(order_id) = order_id {
            query = query.bind(order_id.as_uuid());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::row_to_reservation).collect()
    }
}

#[async_trait]
impl StockReservationStore for PostgresStockReservationStore {
    async fn save(&self, reservation: &StockReservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO stock_reservations
                (id, order_id, product_id, quantity, status, reserved_at, expires_at, confirmed_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                status = EXCLUDED.status,
                confirmed_at = EXCLUDED.confirmed_at
            "#,
        )
        .bind(reservation.id.as_uuid())
        .bind(reservation.order_id.as_uuid())
        .bind(reservation.product_id.as_uuid())
        .bind(reservation.quantity as i32)
        .bind(Self::status_str(reservation.status))
        .bind(reservation.reserved_at)
        .bind(reservation.expires_at)
        .bind(reservation.confirmed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn find_by_id(&self, id: ReservationId) -> Result<Option<StockReservation>> {
        let row = sqlx::query(
            r#"
            SELECT id, order_id, product_id, quantity, status, reserved_at, expires_at, confirmed_at
            FROM stock_reservations
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_reservation).transpose()
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        self.fetch_many(
            r#"
            SELECT id, order_id, product_id, quantity, status, reserved_at, expires_at, confirmed_at
            FROM stock_reservations
            WHERE order_id = $1
            ORDER BY reserved_at ASC
            "#,
            Some(order_id),
        )
        .await
    }

    async fn find_pending_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        self.fetch_many(
            r#"
            SELECT id, order_id, product_id, quantity, status, reserved_at, expires_at, confirmed_at
            FROM stock_reservations
            WHERE order_id = $1 AND status = 'RESERVED'
            ORDER BY reserved_at ASC
            "#,
            Some(order_id),
        )
        .await
    }

    async fn find_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, product_id, quantity, status, reserved_at, expires_at, confirmed_at
            FROM stock_reservations
            WHERE status = 'RESERVED' AND expires_at <= $1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_reservation).collect()
    }
}
