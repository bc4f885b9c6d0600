//! Saga domain events.

use common::{Money, OrderId, ProductId, UserId};
use serde::{Deserialize, Serialize};

/// One order line: a product and how many units of it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// Events that drive the order-payment saga.
///
/// Each event is appended to the outbox inside the unit of work that
/// produced it and consumed only after that unit of work completes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum DomainEvent {
    /// An order was placed; its lines need stock reserved.
    OrderCreated {
        order_id: OrderId,
        user_id: UserId,
        lines: Vec<OrderLine>,
    },

    /// Every line of the order is reserved.
    ReservationCompleted { order_id: OrderId },

    /// At least one line could not be reserved; the order is doomed.
    ReservationFailed { order_id: OrderId, reason: String },

    /// A payment attempt is due for the order.
    PaymentCreated {
        order_id: OrderId,
        user_id: UserId,
        amount: Money,
    },

    /// The payment settled; reservations may be confirmed.
    PaymentCompleted { order_id: OrderId },

    /// The payment failed; reservations must be returned.
    PaymentFailed { order_id: OrderId, reason: String },
}

impl DomainEvent {
    /// Stable event-type tag used for outbox routing and logging.
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::OrderCreated { .. } => "OrderCreated",
            DomainEvent::ReservationCompleted { .. } => "ReservationCompleted",
            DomainEvent::ReservationFailed { .. } => "ReservationFailed",
            DomainEvent::PaymentCreated { .. } => "PaymentCreated",
            DomainEvent::PaymentCompleted { .. } => "PaymentCompleted",
            DomainEvent::PaymentFailed { .. } => "PaymentFailed",
        }
    }

    /// The order this event belongs to.
    pub fn order_id(&self) -> OrderId {
        match self {
            DomainEvent::OrderCreated { order_id, .. }
            | DomainEvent::ReservationCompleted { order_id }
            | DomainEvent::ReservationFailed { order_id, .. }
            | DomainEvent::PaymentCreated { order_id, .. }
            | DomainEvent::PaymentCompleted { order_id }
            | DomainEvent::PaymentFailed { order_id, .. } => *order_id,
        }
    }
}
