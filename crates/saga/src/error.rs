//! Saga error types.

use common::{Money, OrderId, UserId};
use stock::StockError;
use store::StoreError;
use thiserror::Error;

/// Errors that can occur while driving the order-payment saga.
#[derive(Debug, Error)]
pub enum SagaError {
    /// Order not found.
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order is in the wrong state for the requested transition.
    #[error("order {order_id} cannot transition: {detail}")]
    InvalidTransition { order_id: OrderId, detail: String },

    /// The user's balance cannot cover the charge.
    #[error("user {user_id} has {available}, payment requires {required}")]
    InsufficientBalance {
        user_id: UserId,
        required: Money,
        available: Money,
    },

    /// A stock operation failed.
    #[error(transparent)]
    Stock(#[from] StockError),

    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Event payload serialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// True for failures that re-running the handler cannot fix. Business
    /// failures settle the saga (usually by cancelling the order);
    /// infrastructure failures leave the event pending for redelivery.
    pub fn is_business(&self) -> bool {
        match self {
            SagaError::OrderNotFound(_)
            | SagaError::InvalidTransition { .. }
            | SagaError::InsufficientBalance { .. } => true,
            SagaError::Stock(e) => e.is_business(),
            SagaError::Store(_) | SagaError::Serialization(_) => false,
        }
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
