//! Serialized stock mutations.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{OrderId, ProductId, ReservationId};
use concurrency::LockCoordinator;

use crate::error::{Result, StockError};
use crate::reservation::{ReservationStatus, StockReservation};
use crate::store_api::{ProductStockStore, StockReservationStore};

/// Tuning knobs for the stock ledger.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a reservation holds its quantity before the sweeper
    /// reclaims it.
    pub reservation_ttl: chrono::Duration,
    /// How long a mutation waits for the product lock.
    pub lock_wait: Duration,
    /// Lease on the product lock.
    pub lock_lease: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            reservation_ttl: chrono::Duration::minutes(10),
            lock_wait: Duration::from_secs(30),
            lock_lease: Duration::from_secs(10),
        }
    }
}

/// The only writer of product stock rows and reservation states.
///
/// Every operation runs under the per-product lock, so the read-check-write
/// sequences below never interleave for one product. The version stamp on
/// the stock row still guards against writers outside this process.
#[derive(Clone)]
pub struct StockLedger {
    products: Arc<dyn ProductStockStore>,
    reservations: Arc<dyn StockReservationStore>,
    locks: LockCoordinator,
    config: LedgerConfig,
}

fn product_lock_key(product_id: ProductId) -> String {
    format!("stock:lock:{product_id}")
}

impl StockLedger {
    pub fn new(
        products: Arc<dyn ProductStockStore>,
        reservations: Arc<dyn StockReservationStore>,
        locks: LockCoordinator,
        config: LedgerConfig,
    ) -> Self {
        Self {
            products,
            reservations,
            locks,
            config,
        }
    }

    /// Earmarks `quantity` of `product_id` for `order_id`.
    #[tracing::instrument(skip(self), fields(%order_id, %product_id))]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<StockReservation> {
        let _guard = self
            .locks
            .acquire_scoped(
                &product_lock_key(product_id),
                self.config.lock_wait,
                self.config.lock_lease,
            )
            .await?;

        let mut product = self
            .products
            .find_by_product(product_id)
            .await?
            .ok_or(StockError::ProductNotFound(product_id))?;
        product.reserve(quantity)?;

        let now = Utc::now();
        let reservation = StockReservation::new(
            order_id,
            product_id,
            quantity,
            now,
            now + self.config.reservation_ttl,
        );

        self.products.save(&product).await?;
        self.reservations.save(&reservation).await?;

        metrics::counter!("stock_reserved_total").increment(u64::from(quantity));
        tracing::info!(reservation_id = %reservation.id, quantity, "stock reserved");
        Ok(reservation)
    }

    /// Deducts a reservation's quantity for good. Requires RESERVED.
    #[tracing::instrument(skip(self), fields(%reservation_id))]
    pub async fn confirm(&self, reservation_id: ReservationId) -> Result<()> {
        let probe = self
            .reservations
            .find_by_id(reservation_id)
            .await?
            .ok_or(StockError::ReservationNotFound(reservation_id))?;

        let _guard = self
            .locks
            .acquire_scoped(
                &product_lock_key(probe.product_id),
                self.config.lock_wait,
                self.config.lock_lease,
            )
            .await?;

        // Re-read under the lock; the probe may be stale.
        let mut reservation = self
            .reservations
            .find_by_id(reservation_id)
            .await?
            .ok_or(StockError::ReservationNotFound(reservation_id))?;
        reservation.confirm(Utc::now())?;

        let mut product = self
            .products
            .find_by_product(reservation.product_id)
            .await?
            .ok_or(StockError::ProductNotFound(reservation.product_id))?;
        product.confirm(reservation.quantity)?;

        self.products.save(&product).await?;
        self.reservations.save(&reservation).await?;

        metrics::counter!("stock_confirmed_total").increment(u64::from(reservation.quantity));
        tracing::info!(quantity = reservation.quantity, "stock confirmed");
        Ok(())
    }

    /// Returns a reservation's quantity to the available pool. Idempotent:
    /// an already-terminal reservation is a no-op returning false.
    #[tracing::instrument(skip(self), fields(%reservation_id))]
    pub async fn release(&self, reservation_id: ReservationId) -> Result<bool> {
        self.return_quantity(reservation_id, "stock_released_total")
            .await
    }

    /// Reclaims an expired reservation. Same semantics as [`release`];
    /// kept separate so expiry shows up under its own metric.
    ///
    /// [`release`]: Self::release
    #[tracing::instrument(skip(self), fields(%reservation_id))]
    pub async fn expire(&self, reservation_id: ReservationId) -> Result<bool> {
        self.return_quantity(reservation_id, "stock_expired_total")
            .await
    }

    async fn return_quantity(
        &self,
        reservation_id: ReservationId,
        metric: &'static str,
    ) -> Result<bool> {
        let probe = self
            .reservations
            .find_by_id(reservation_id)
            .await?
            .ok_or(StockError::ReservationNotFound(reservation_id))?;
        if probe.status != ReservationStatus::Reserved {
            return Ok(false);
        }

        let _guard = self
            .locks
            .acquire_scoped(
                &product_lock_key(probe.product_id),
                self.config.lock_wait,
                self.config.lock_lease,
            )
            .await?;

        let mut reservation = self
            .reservations
            .find_by_id(reservation_id)
            .await?
            .ok_or(StockError::ReservationNotFound(reservation_id))?;
        if !reservation.release() {
            return Ok(false);
        }

        let mut product = self
            .products
            .find_by_product(reservation.product_id)
            .await?
            .ok_or(StockError::ProductNotFound(reservation.product_id))?;
        product.release(reservation.quantity)?;

        self.products.save(&product).await?;
        self.reservations.save(&reservation).await?;

        metrics::counter!(metric).increment(u64::from(reservation.quantity));
        tracing::info!(quantity = reservation.quantity, "stock returned");
        Ok(true)
    }

    /// Reservation TTL currently in force.
    pub fn reservation_ttl(&self) -> chrono::Duration {
        self.config.reservation_ttl
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{InMemoryProductStockStore, InMemoryStockReservationStore};

    struct Fixture {
        ledger: StockLedger,
        products: Arc<InMemoryProductStockStore>,
        product_id: ProductId,
    }

    async fn fixture(current: u32) -> Fixture {
        fixture_with_config(current, LedgerConfig::default()).await
    }

    async fn fixture_with_config(current: u32, config: LedgerConfig) -> Fixture {
        let products = Arc::new(InMemoryProductStockStore::new());
        let reservations = Arc::new(InMemoryStockReservationStore::new());

        let product_id = ProductId::new();
        products
            .save(&crate::ProductStock::new(product_id, current))
            .await
            .unwrap();

        let ledger = StockLedger::new(
            products.clone(),
            reservations,
            LockCoordinator::new(),
            config,
        );
        Fixture {
            ledger,
            products,
            product_id,
        }
    }

    #[tokio::test]
    async fn reserve_confirm_lifecycle() {
        let fx = fixture(10).await;
        let reservation = fx
            .ledger
            .reserve(OrderId::new(), fx.product_id, 4)
            .await
            .unwrap();

        let stock = fx
            .products
            .find_by_product(fx.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stock.reserved, 4);
        assert_eq!(stock.current, 10);

        fx.ledger.confirm(reservation.id).await.unwrap();
        let stock = fx
            .products
            .find_by_product(fx.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stock.current, 6);
        assert_eq!(stock.reserved, 0);
    }

    #[tokio::test]
    async fn release_returns_quantity() {
        let fx = fixture(10).await;
        let reservation = fx
            .ledger
            .reserve(OrderId::new(), fx.product_id, 4)
            .await
            .unwrap();

        assert!(fx.ledger.release(reservation.id).await.unwrap());
        // Redelivered release is a no-op.
        assert!(!fx.ledger.release(reservation.id).await.unwrap());

        let stock = fx
            .products
            .find_by_product(fx.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stock.current, 10);
        assert_eq!(stock.reserved, 0);
    }

    #[tokio::test]
    async fn confirm_after_release_is_invalid() {
        let fx = fixture(10).await;
        let reservation = fx
            .ledger
            .reserve(OrderId::new(), fx.product_id, 4)
            .await
            .unwrap();
        fx.ledger.release(reservation.id).await.unwrap();

        let err = fx.ledger.confirm(reservation.id).await.unwrap_err();
        assert!(matches!(err, StockError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn double_confirm_is_invalid() {
        let fx = fixture(10).await;
        let reservation = fx
            .ledger
            .reserve(OrderId::new(), fx.product_id, 4)
            .await
            .unwrap();
        fx.ledger.confirm(reservation.id).await.unwrap();

        let err = fx.ledger.confirm(reservation.id).await.unwrap_err();
        assert!(matches!(err, StockError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn concurrent_reserves_admit_only_available_quantity() {
        let fx = fixture(10).await;

        let mut tasks = Vec::new();
        for _ in 0..2 {
            let ledger = fx.ledger.clone();
            let product_id = fx.product_id;
            tasks.push(tokio::spawn(async move {
                ledger.reserve(OrderId::new(), product_id, 6).await
            }));
        }

        let mut ok = 0;
        let mut out_of_stock = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => ok += 1,
                Err(StockError::OutOfStock { .. }) => out_of_stock += 1,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(ok, 1);
        assert_eq!(out_of_stock, 1);

        let stock = fx
            .products
            .find_by_product(fx.product_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stock.reserved, 6);
    }

    #[tokio::test]
    async fn unknown_product_is_not_found() {
        let fx = fixture(10).await;
        let err = fx
            .ledger
            .reserve(OrderId::new(), ProductId::new(), 1)
            .await
            .unwrap_err();
        assert!(matches!(err, StockError::ProductNotFound(_)));
    }
}
