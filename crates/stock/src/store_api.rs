//! Repository ports for stock rows and reservations.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use store::Result;

use crate::product_stock::ProductStock;
use crate::reservation::StockReservation;

/// Durable storage for product stock rows. `save` is version-stamped like
/// every mutable aggregate in this workspace.
#[async_trait]
pub trait ProductStockStore: Send + Sync {
    async fn save(&self, stock: &ProductStock) -> Result<()>;
    async fn find_by_product(&self, product_id: ProductId) -> Result<Option<ProductStock>>;
}

/// Durable storage for reservations.
#[async_trait]
pub trait StockReservationStore: Send + Sync {
    async fn save(&self, reservation: &StockReservation) -> Result<()>;
    async fn find_by_id(&self, id: ReservationId) -> Result<Option<StockReservation>>;
    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>>;
    /// Reservations of an order still in RESERVED state.
    async fn find_pending_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>>;
    /// RESERVED reservations whose `expires_at` is at or before `cutoff`.
    async fn find_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>>;
}
