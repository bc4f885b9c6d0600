//! Saga event handlers.

use std::collections::HashSet;
use std::sync::Arc;

use common::{Money, OrderId, ProductId, UserId};
use stock::{StockLedger, StockReservationStore};
use store::AtomicStore;

use crate::dispatcher::EventHandler;
use crate::error::{Result, SagaError};
use crate::events::{DomainEvent, OrderLine};
use crate::order::OrderStore;
use crate::outbox::EventPublisher;
use crate::payment::BalanceLedger;

/// Reserves, confirms, and releases stock as the saga progresses.
///
/// Reservation is all-or-nothing per order: if any line cannot be
/// reserved, the lines already reserved for the order are released and a
/// `ReservationFailed` is published instead of an error, since retrying
/// cannot conjure stock. Redelivered `OrderCreated` events skip lines that
/// already have a reservation.
pub struct StockReservationHandler {
    ledger: StockLedger,
    reservations: Arc<dyn StockReservationStore>,
    publisher: EventPublisher,
}

impl StockReservationHandler {
    pub fn new(
        ledger: StockLedger,
        reservations: Arc<dyn StockReservationStore>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            ledger,
            reservations,
            publisher,
        }
    }

    async fn reserve_all(&self, order_id: OrderId, lines: &[OrderLine]) -> Result<()> {
        let already_reserved: HashSet<ProductId> = self
            .reservations
            .find_by_order(order_id)
            .await?
            .into_iter()
            .map(|r| r.product_id)
            .collect();

        for line in lines {
            if already_reserved.contains(&line.product_id) {
                continue;
            }
            match self
                .ledger
                .reserve(order_id, line.product_id, line.quantity)
                .await
            {
                Ok(_) => {}
                Err(e) if e.is_business() => {
                    tracing::warn!(%order_id, product_id = %line.product_id, error = %e, "reservation failed");
                    self.release_pending(order_id).await?;
                    self.publisher
                        .publish(&DomainEvent::ReservationFailed {
                            order_id,
                            reason: e.to_string(),
                        })
                        .await?;
                    return Ok(());
                }
                Err(e) => return Err(e.into()),
            }
        }

        self.publisher
            .publish(&DomainEvent::ReservationCompleted { order_id })
            .await?;
        Ok(())
    }

    async fn confirm_pending(&self, order_id: OrderId) -> Result<()> {
        for reservation in self.reservations.find_pending_by_order(order_id).await? {
            match self.ledger.confirm(reservation.id).await {
                Ok(()) => {}
                // Settled between the query and the confirm (e.g. swept by
                // expiry); confirming it now would be wrong anyway.
                Err(e) if e.is_business() => {
                    tracing::warn!(%order_id, reservation_id = %reservation.id, error = %e, "skipping confirm");
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    async fn release_pending(&self, order_id: OrderId) -> Result<()> {
        for reservation in self.reservations.find_pending_by_order(order_id).await? {
            self.ledger.release(reservation.id).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl EventHandler for StockReservationHandler {
    fn name(&self) -> &'static str {
        "stock-reservation"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::OrderCreated {
                order_id, lines, ..
            } => self.reserve_all(*order_id, lines).await,
            DomainEvent::PaymentCompleted { order_id } => self.confirm_pending(*order_id).await,
            DomainEvent::PaymentFailed { order_id, .. } => self.release_pending(*order_id).await,
            _ => Ok(()),
        }
    }
}

/// Advances order state as saga events arrive.
///
/// An event that no longer fits the order's state (a stale redelivery
/// racing a cancellation, say) is logged and dropped rather than retried,
/// because re-running it can never make it fit.
pub struct OrderProgressHandler {
    orders: Arc<dyn OrderStore>,
}

impl OrderProgressHandler {
    pub fn new(orders: Arc<dyn OrderStore>) -> Self {
        Self { orders }
    }

    async fn apply<F>(&self, order_id: OrderId, transition: F) -> Result<()>
    where
        F: FnOnce(&mut crate::order::Order) -> Result<bool>,
    {
        let mut order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;

        match transition(&mut order) {
            Ok(true) => {
                self.orders.save(&order).await?;
                tracing::info!(%order_id, status = %order.status, "order advanced");
                Ok(())
            }
            Ok(false) => Ok(()),
            Err(e @ SagaError::InvalidTransition { .. }) => {
                tracing::warn!(%order_id, error = %e, "dropping stale event");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait::async_trait]
impl EventHandler for OrderProgressHandler {
    fn name(&self) -> &'static str {
        "order-progress"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::ReservationCompleted { order_id } => {
                self.apply(*order_id, |o| o.mark_payment_eligible()).await
            }
            DomainEvent::PaymentCompleted { order_id } => {
                self.apply(*order_id, |o| o.complete_payment()).await
            }
            DomainEvent::ReservationFailed { order_id, .. }
            | DomainEvent::PaymentFailed { order_id, .. } => {
                self.apply(*order_id, |o| o.cancel()).await
            }
            _ => Ok(()),
        }
    }
}

/// Set of order ids whose payment attempt has already been settled.
const PAYMENT_DEDUP_KEY: &str = "payments:settled:orders";

/// Debits the buyer's balance exactly once per order.
///
/// The dedup mark in the shared store makes the debit idempotent under
/// redelivery. Both outcomes of a settled attempt are terminal: success
/// publishes `PaymentCompleted`, insufficient balance publishes
/// `PaymentFailed`, and neither is retried automatically.
pub struct PaymentHandler<A: AtomicStore> {
    balances: Arc<dyn BalanceLedger>,
    atomic: Arc<A>,
    publisher: EventPublisher,
}

impl<A: AtomicStore> PaymentHandler<A> {
    pub fn new(
        balances: Arc<dyn BalanceLedger>,
        atomic: Arc<A>,
        publisher: EventPublisher,
    ) -> Self {
        Self {
            balances,
            atomic,
            publisher,
        }
    }

    async fn settle(&self, order_id: OrderId, user_id: UserId, amount: Money) -> Result<()> {
        let newly_settled = self
            .atomic
            .set_add(PAYMENT_DEDUP_KEY, &order_id.to_string())
            .await?;
        if !newly_settled {
            return Ok(());
        }

        let outcome = match self.balances.debit(user_id, amount).await {
            Ok(()) => DomainEvent::PaymentCompleted { order_id },
            Err(e @ SagaError::InsufficientBalance { .. }) => {
                tracing::warn!(%order_id, %user_id, error = %e, "payment declined");
                metrics::counter!("payments_declined_total").increment(1);
                DomainEvent::PaymentFailed {
                    order_id,
                    reason: e.to_string(),
                }
            }
            Err(e) => {
                // The debit never happened; unmark so redelivery retries it.
                self.atomic
                    .set_remove(PAYMENT_DEDUP_KEY, &order_id.to_string())
                    .await?;
                return Err(e);
            }
        };

        if let Err(e) = self.publisher.publish(&outcome).await {
            // Undo the whole attempt or the outcome event is lost for good.
            if matches!(outcome, DomainEvent::PaymentCompleted { .. }) {
                self.balances.credit(user_id, amount).await?;
            }
            self.atomic
                .set_remove(PAYMENT_DEDUP_KEY, &order_id.to_string())
                .await?;
            return Err(e.into());
        }

        metrics::counter!("payments_settled_total").increment(1);
        Ok(())
    }
}

#[async_trait::async_trait]
impl<A: AtomicStore> EventHandler for PaymentHandler<A> {
    fn name(&self) -> &'static str {
        "payment"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        match event {
            DomainEvent::PaymentCreated {
                order_id,
                user_id,
                amount,
            } => self.settle(*order_id, *user_id, *amount).await,
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use store::InMemoryAtomicStore;

    use super::*;
    use crate::outbox::{InMemoryOutboxStore, OutboxStore};
    use crate::payment::InMemoryBalanceLedger;

    fn payment_fixture() -> (
        PaymentHandler<InMemoryAtomicStore>,
        Arc<InMemoryBalanceLedger>,
        InMemoryOutboxStore,
    ) {
        let balances = Arc::new(InMemoryBalanceLedger::new());
        let outbox = InMemoryOutboxStore::new();
        let handler = PaymentHandler::new(
            balances.clone(),
            Arc::new(InMemoryAtomicStore::new()),
            EventPublisher::new(Arc::new(outbox.clone())),
        );
        (handler, balances, outbox)
    }

    #[tokio::test]
    async fn redelivered_payment_debits_once() {
        let (handler, balances, outbox) = payment_fixture();
        let user_id = UserId::new();
        balances.credit(user_id, Money::from_dollars(100)).await.unwrap();

        let event = DomainEvent::PaymentCreated {
            order_id: OrderId::new(),
            user_id,
            amount: Money::from_dollars(40),
        };
        handler.handle(&event).await.unwrap();
        handler.handle(&event).await.unwrap();

        assert_eq!(
            balances.balance(user_id).await.unwrap(),
            Money::from_dollars(60)
        );
        // Exactly one outcome event.
        let pending = outbox.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "PaymentCompleted");
    }

    #[tokio::test]
    async fn insufficient_balance_publishes_payment_failed() {
        let (handler, balances, outbox) = payment_fixture();
        let user_id = UserId::new();
        balances.credit(user_id, Money::from_dollars(5)).await.unwrap();

        let event = DomainEvent::PaymentCreated {
            order_id: OrderId::new(),
            user_id,
            amount: Money::from_dollars(40),
        };
        handler.handle(&event).await.unwrap();

        let pending = outbox.find_pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].event_type, "PaymentFailed");
        // Balance untouched.
        assert_eq!(
            balances.balance(user_id).await.unwrap(),
            Money::from_dollars(5)
        );

        // The attempt is terminal; redelivery does not retry the charge.
        handler.handle(&event).await.unwrap();
        assert_eq!(outbox.find_pending(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unrelated_events_are_ignored() {
        let (handler, _, outbox) = payment_fixture();
        handler
            .handle(&DomainEvent::ReservationCompleted {
                order_id: OrderId::new(),
            })
            .await
            .unwrap();
        assert!(outbox.find_pending(10).await.unwrap().is_empty());
    }
}
