//! Order aggregate and placement service.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Money, OrderId, UserId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SagaError};
use crate::events::{DomainEvent, OrderLine};
use crate::outbox::EventPublisher;

/// Lifecycle state of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed; stock reservation in flight.
    Pending,
    /// Every line reserved; waiting for the user to pay.
    AwaitingPayment,
    /// Paid; reservations confirmed.
    PaymentCompleted,
    /// Reservation or payment failed, or the order was cancelled.
    Cancelled,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::AwaitingPayment => "AWAITING_PAYMENT",
            OrderStatus::PaymentCompleted => "PAYMENT_COMPLETED",
            OrderStatus::Cancelled => "CANCELLED",
        };
        f.write_str(s)
    }
}

/// A customer order.
///
/// Transitions are driven by saga events and are tolerant of redelivery:
/// applying a transition the order has already taken is a no-op, while a
/// genuinely wrong transition is an `InvalidTransition` error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub status: OrderStatus,
    pub total: Money,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: Version,
}

impl Order {
    /// Creates a PENDING order.
    pub fn new(user_id: UserId, total: Money) -> Self {
        let now = Utc::now();
        Self {
            id: OrderId::new(),
            user_id,
            status: OrderStatus::Pending,
            total,
            created_at: now,
            updated_at: now,
            version: Version::initial(),
        }
    }

    /// PENDING → AWAITING_PAYMENT. Returns false if already there.
    pub fn mark_payment_eligible(&mut self) -> Result<bool> {
        match self.status {
            OrderStatus::Pending => {
                self.transition(OrderStatus::AwaitingPayment);
                Ok(true)
            }
            OrderStatus::AwaitingPayment => Ok(false),
            other => Err(SagaError::InvalidTransition {
                order_id: self.id,
                detail: format!("{other} order cannot await payment"),
            }),
        }
    }

    /// AWAITING_PAYMENT → PAYMENT_COMPLETED. Returns false if already
    /// there.
    pub fn complete_payment(&mut self) -> Result<bool> {
        match self.status {
            OrderStatus::AwaitingPayment => {
                self.transition(OrderStatus::PaymentCompleted);
                Ok(true)
            }
            OrderStatus::PaymentCompleted => Ok(false),
            other => Err(SagaError::InvalidTransition {
                order_id: self.id,
                detail: format!("{other} order cannot complete payment"),
            }),
        }
    }

    /// Any non-paid state → CANCELLED. Returns false if already cancelled.
    pub fn cancel(&mut self) -> Result<bool> {
        match self.status {
            OrderStatus::Pending | OrderStatus::AwaitingPayment => {
                self.transition(OrderStatus::Cancelled);
                Ok(true)
            }
            OrderStatus::Cancelled => Ok(false),
            OrderStatus::PaymentCompleted => Err(SagaError::InvalidTransition {
                order_id: self.id,
                detail: "paid order cannot be cancelled".into(),
            }),
        }
    }

    fn transition(&mut self, to: OrderStatus) {
        self.status = to;
        self.updated_at = Utc::now();
    }
}

/// Durable storage for orders, version-stamped like every mutable aggregate
/// in this workspace.
#[async_trait]
pub trait OrderStore: Send + Sync {
    async fn save(&self, order: &Order) -> store::Result<()>;
    async fn find_by_id(&self, id: OrderId) -> store::Result<Option<Order>>;
}

/// In-memory [`OrderStore`].
#[derive(Clone, Default)]
pub struct InMemoryOrderStore {
    orders: Arc<RwLock<HashMap<OrderId, Order>>>,
}

impl InMemoryOrderStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OrderStore for InMemoryOrderStore {
    async fn save(&self, order: &Order) -> store::Result<()> {
        let mut orders = self.orders.write().unwrap();
        if let Some(stored) = orders.get(&order.id)
            && stored.version != order.version
        {
            return Err(store::StoreError::VersionConflict {
                entity: "order",
                id: order.id.to_string(),
                expected: order.version,
                actual: stored.version,
            });
        }
        let mut saved = order.clone();
        saved.version = order.version.next();
        orders.insert(order.id, saved);
        Ok(())
    }

    async fn find_by_id(&self, id: OrderId) -> store::Result<Option<Order>> {
        Ok(self.orders.read().unwrap().get(&id).cloned())
    }
}

/// Places orders and kicks off the saga.
pub struct OrderService {
    orders: Arc<dyn OrderStore>,
    publisher: EventPublisher,
}

impl OrderService {
    pub fn new(orders: Arc<dyn OrderStore>, publisher: EventPublisher) -> Self {
        Self { orders, publisher }
    }

    /// Persists a new PENDING order and appends `OrderCreated` to the
    /// outbox. Reservation and payment happen asynchronously.
    #[tracing::instrument(skip(self, lines), fields(%user_id))]
    pub async fn place_order(
        &self,
        user_id: UserId,
        lines: Vec<OrderLine>,
        total: Money,
    ) -> Result<Order> {
        let order = Order::new(user_id, total);
        self.orders.save(&order).await?;
        self.publisher
            .publish(&DomainEvent::OrderCreated {
                order_id: order.id,
                user_id,
                lines,
            })
            .await?;

        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(order_id = %order.id, %total, "order placed");
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut order = Order::new(UserId::new(), Money::from_dollars(30));
        assert_eq!(order.status, OrderStatus::Pending);

        assert!(order.mark_payment_eligible().unwrap());
        assert_eq!(order.status, OrderStatus::AwaitingPayment);

        assert!(order.complete_payment().unwrap());
        assert_eq!(order.status, OrderStatus::PaymentCompleted);
    }

    #[test]
    fn redelivered_transitions_are_no_ops() {
        let mut order = Order::new(UserId::new(), Money::from_dollars(30));
        order.mark_payment_eligible().unwrap();
        assert!(!order.mark_payment_eligible().unwrap());

        order.complete_payment().unwrap();
        assert!(!order.complete_payment().unwrap());
    }

    #[test]
    fn cancel_is_idempotent_but_never_undoes_payment() {
        let mut order = Order::new(UserId::new(), Money::from_dollars(30));
        assert!(order.cancel().unwrap());
        assert!(!order.cancel().unwrap());

        let mut paid = Order::new(UserId::new(), Money::from_dollars(30));
        paid.mark_payment_eligible().unwrap();
        paid.complete_payment().unwrap();
        assert!(matches!(
            paid.cancel(),
            Err(SagaError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn pending_order_cannot_complete_payment() {
        let mut order = Order::new(UserId::new(), Money::from_dollars(30));
        assert!(matches!(
            order.complete_payment(),
            Err(SagaError::InvalidTransition { .. })
        ));
    }
}
