//! Stock error taxonomy.

use common::{ProductId, ReservationId};
use concurrency::LockError;
use store::StoreError;
use thiserror::Error;

use crate::reservation::ReservationStatus;

/// Errors raised by the stock ledger.
#[derive(Debug, Error)]
pub enum StockError {
    /// Not enough unreserved quantity to satisfy the request.
    #[error("product {product_id} out of stock: requested {requested}, available {available}")]
    OutOfStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },

    /// The operation requires a different reservation state.
    #[error("reservation {reservation_id} is {actual:?}, operation requires {required:?}")]
    InvalidState {
        reservation_id: ReservationId,
        required: ReservationStatus,
        actual: ReservationStatus,
    },

    /// No stock row exists for the product.
    #[error("product stock not found: {0}")]
    ProductNotFound(ProductId),

    /// The reservation does not exist.
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Stock arithmetic would underflow; the rows are inconsistent.
    #[error("stock ledger for product {product_id} is inconsistent: {detail}")]
    Inconsistent {
        product_id: ProductId,
        detail: String,
    },

    /// A lock acquisition timed out.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl StockError {
    /// True for failures caused by the request itself (insufficient stock,
    /// wrong state) rather than by infrastructure.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            StockError::OutOfStock { .. }
                | StockError::InvalidState { .. }
                | StockError::ProductNotFound(_)
                | StockError::ReservationNotFound(_)
        )
    }
}

/// Result type for stock operations.
pub type Result<T> = std::result::Result<T, StockError>;
