//! Order-to-payment saga.
//!
//! Order placement, stock reservation, and payment are separate units of
//! work stitched together by domain events flowing through a transactional
//! outbox. Delivery is at-least-once: handlers are idempotent or
//! state-checked, a failing handler leaves its record pending for
//! redelivery, and records that keep failing are parked as dead letters.

pub mod dispatcher;
pub mod error;
pub mod events;
pub mod listeners;
pub mod order;
pub mod outbox;
pub mod payment;
pub mod postgres;

pub use dispatcher::{DispatcherConfig, EventHandler, OutboxDispatcher};
pub use error::{Result, SagaError};
pub use events::{DomainEvent, OrderLine};
pub use listeners::{OrderProgressHandler, PaymentHandler, StockReservationHandler};
pub use order::{InMemoryOrderStore, Order, OrderService, OrderStatus, OrderStore};
pub use outbox::{
    EventPublisher, InMemoryOutboxStore, OutboxRecord, OutboxStatus, OutboxStore,
};
pub use payment::{BalanceLedger, InMemoryBalanceLedger, PaymentService};
pub use postgres::{PostgresOrderStore, PostgresOutboxStore};
