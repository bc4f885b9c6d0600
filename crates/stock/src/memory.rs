//! In-memory stock repositories.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use store::{Result, StoreError};

use crate::product_stock::ProductStock;
use crate::reservation::{ReservationStatus, StockReservation};
use crate::store_api::{ProductStockStore, StockReservationStore};

/// In-memory [`ProductStockStore`] with version-stamped saves.
#[derive(Clone, Default)]
pub struct InMemoryProductStockStore {
    rows: Arc<RwLock<HashMap<ProductId, ProductStock>>>,
}

impl InMemoryProductStockStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProductStockStore for InMemoryProductStockStore {
    async fn save(&self, stock: &ProductStock) -> Result<()> {
        let mut rows = self.rows.write().unwrap();
        if let Some(stored) = rows.get(&stock.product_id)
            && stored.version != stock.version
        {
            return Err(StoreError::VersionConflict {
                entity: "product_stock",
                id: stock.product_id.to_string(),
                expected: stock.version,
                actual: stored.version,
            });
        }
        let mut saved = stock.clone();
        saved.version = stock.version.next();
        rows.insert(stock.product_id, saved);
        Ok(())
    }

    async fn find_by_product(&self, product_id: ProductId) -> Result<Option<ProductStock>> {
        Ok(self.rows.read().unwrap().get(&product_id).cloned())
    }
}

/// In-memory [`StockReservationStore`].
#[derive(Clone, Default)]
pub struct InMemoryStockReservationStore {
    rows: Arc<RwLock<HashMap<ReservationId, StockReservation>>>,
}

impl InMemoryStockReservationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StockReservationStore for InMemoryStockReservationStore {
    async fn save(&self, reservation: &StockReservation) -> Result<()> {
        self.rows
            .write()
            .unwrap()
            .insert(reservation.id, reservation.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: ReservationId) -> Result<Option<StockReservation>> {
        Ok(self.rows.read().unwrap().get(&id).cloned())
    }

    async fn find_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.order_id == order_id)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.reserved_at);
        Ok(found)
    }

    async fn find_pending_by_order(&self, order_id: OrderId) -> Result<Vec<StockReservation>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.order_id == order_id && r.status == ReservationStatus::Reserved)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.reserved_at);
        Ok(found)
    }

    async fn find_expired_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<StockReservation>> {
        let mut found: Vec<_> = self
            .rows
            .read()
            .unwrap()
            .values()
            .filter(|r| r.status == ReservationStatus::Reserved && r.expires_at <= cutoff)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.expires_at);
        Ok(found)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    #[tokio::test]
    async fn stale_stock_save_conflicts() {
        let stocks = InMemoryProductStockStore::new();
        let stock = ProductStock::new(ProductId::new(), 10);
        stocks.save(&stock).await.unwrap();

        let err = stocks.save(&stock).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn pending_filter_excludes_terminal_states() {
        let reservations = InMemoryStockReservationStore::new();
        let order_id = OrderId::new();
        let now = Utc::now();

        let open = StockReservation::new(
            order_id,
            ProductId::new(),
            1,
            now,
            now + Duration::minutes(10),
        );
        let mut closed = StockReservation::new(
            order_id,
            ProductId::new(),
            1,
            now,
            now + Duration::minutes(10),
        );
        closed.release();
        reservations.save(&open).await.unwrap();
        reservations.save(&closed).await.unwrap();

        let pending = reservations.find_pending_by_order(order_id).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, open.id);

        let all = reservations.find_by_order(order_id).await.unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn expired_lookup_respects_cutoff_and_status() {
        let reservations = InMemoryStockReservationStore::new();
        let now = Utc::now();

        let expired = StockReservation::new(
            OrderId::new(),
            ProductId::new(),
            1,
            now - Duration::minutes(20),
            now - Duration::minutes(10),
        );
        let fresh = StockReservation::new(
            OrderId::new(),
            ProductId::new(),
            1,
            now,
            now + Duration::minutes(10),
        );
        let mut expired_but_confirmed = StockReservation::new(
            OrderId::new(),
            ProductId::new(),
            1,
            now - Duration::minutes(20),
            now - Duration::minutes(10),
        );
        expired_but_confirmed.confirm(now - Duration::minutes(15)).unwrap();

        for r in [&expired, &fresh, &expired_but_confirmed] {
            reservations.save(r).await.unwrap();
        }

        let found = reservations.find_expired_before(now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, expired.id);
    }
}
