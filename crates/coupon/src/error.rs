//! Coupon issuance error taxonomy.

use common::{CouponId, UserId};
use concurrency::{Conflict, LockError};
use store::StoreError;
use thiserror::Error;

/// Errors raised by the coupon issuance pipeline.
#[derive(Debug, Error)]
pub enum CouponError {
    /// The coupon does not exist.
    #[error("coupon not found: {0}")]
    NotFound(CouponId),

    /// The coupon is inactive, deleted, or its quantity is exhausted.
    #[error("coupon {0} is not available for issuance")]
    NotAvailable(CouponId),

    /// The request arrived outside the coupon's validity window.
    #[error("coupon {0} is outside its validity window")]
    OutsideWindow(CouponId),

    /// The user already holds (or has already requested) this coupon.
    #[error("user {user_id} already requested coupon {coupon_id}")]
    AlreadyIssued {
        coupon_id: CouponId,
        user_id: UserId,
    },

    /// Every issuance slot was claimed before this request.
    #[error("coupon {0} is sold out")]
    SoldOut(CouponId),

    /// Contention on the coupon row outlasted the retry budget.
    #[error("issuance of coupon {coupon_id} still conflicting after {attempts} attempts")]
    Contention { coupon_id: CouponId, attempts: u32 },

    /// A lock acquisition timed out.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// A storage operation failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CouponError {
    /// True for failures caused by the request itself rather than by
    /// infrastructure. Business failures are final; infrastructure failures
    /// are safe to retry on the next scheduler tick.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            CouponError::NotFound(_)
                | CouponError::NotAvailable(_)
                | CouponError::OutsideWindow(_)
                | CouponError::AlreadyIssued { .. }
                | CouponError::SoldOut(_)
        )
    }
}

impl Conflict for CouponError {
    fn is_version_conflict(&self) -> bool {
        matches!(self, CouponError::Store(e) if e.is_version_conflict())
    }
}

/// Result type for coupon operations.
pub type Result<T> = std::result::Result<T, CouponError>;
