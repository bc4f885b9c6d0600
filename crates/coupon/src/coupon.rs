//! Coupon aggregate.

use chrono::{DateTime, Utc};
use common::{CouponId, Money, Version};
use serde::{Deserialize, Serialize};

use crate::error::{CouponError, Result};

/// Discount applied by a coupon at checkout.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DiscountRule {
    /// Fixed amount off.
    Fixed { amount: Money },
    /// Percentage off, 0.0..=100.0.
    Percentage { percent: f64 },
}

/// Lifecycle status of a coupon campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CouponStatus {
    Active,
    Inactive,
    Deleted,
}

/// A limited-quantity coupon campaign.
///
/// `issued_quantity` is authoritative and is only ever advanced by the
/// issuance scheduler; the admission counter in the shared store is a gate,
/// not a ledger. Saves are version-stamped, so a concurrent writer loses
/// with a version conflict instead of silently overcounting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub id: CouponId,
    pub name: String,
    pub discount: DiscountRule,
    pub total_quantity: u32,
    pub issued_quantity: u32,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub status: CouponStatus,
    pub version: Version,
}

impl Coupon {
    /// Creates a new active coupon campaign.
    pub fn new(
        name: impl Into<String>,
        discount: DiscountRule,
        total_quantity: u32,
        valid_from: DateTime<Utc>,
        valid_until: DateTime<Utc>,
    ) -> Self {
        Self {
            id: CouponId::new(),
            name: name.into(),
            discount,
            total_quantity,
            issued_quantity: 0,
            valid_from,
            valid_until,
            status: CouponStatus::Active,
            version: Version::initial(),
        }
    }

    /// Remaining issuable quantity.
    pub fn remaining(&self) -> u32 {
        self.total_quantity.saturating_sub(self.issued_quantity)
    }

    /// Returns an error describing why the coupon cannot be issued at
    /// `now`, or `Ok(())` if it can.
    pub fn check_issuable(&self, now: DateTime<Utc>) -> Result<()> {
        if self.status != CouponStatus::Active {
            return Err(CouponError::NotAvailable(self.id));
        }
        if now < self.valid_from || now > self.valid_until {
            return Err(CouponError::OutsideWindow(self.id));
        }
        if self.remaining() == 0 {
            return Err(CouponError::SoldOut(self.id));
        }
        Ok(())
    }

    /// Consumes one issuance slot. The sole mutator of `issued_quantity`.
    pub fn issue(&mut self, now: DateTime<Utc>) -> Result<()> {
        self.check_issuable(now)?;
        self.issued_quantity += 1;
        Ok(())
    }

    /// Returns one issuance slot. Compensation for an `issue` whose grant
    /// failed to commit.
    pub fn revoke(&mut self) {
        self.issued_quantity = self.issued_quantity.saturating_sub(1);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;

    fn open_coupon(total: u32) -> Coupon {
        let now = Utc::now();
        Coupon::new(
            "launch",
            DiscountRule::Fixed {
                amount: Money::from_dollars(5),
            },
            total,
            now - Duration::hours(1),
            now + Duration::hours(1),
        )
    }

    #[test]
    fn issue_decrements_remaining() {
        let mut coupon = open_coupon(2);
        coupon.issue(Utc::now()).unwrap();
        assert_eq!(coupon.issued_quantity, 1);
        assert_eq!(coupon.remaining(), 1);
    }

    #[test]
    fn issue_past_total_is_sold_out() {
        let mut coupon = open_coupon(1);
        coupon.issue(Utc::now()).unwrap();
        let err = coupon.issue(Utc::now()).unwrap_err();
        assert!(matches!(err, CouponError::SoldOut(_)));
    }

    #[test]
    fn inactive_coupon_is_not_available() {
        let mut coupon = open_coupon(1);
        coupon.status = CouponStatus::Inactive;
        let err = coupon.issue(Utc::now()).unwrap_err();
        assert!(matches!(err, CouponError::NotAvailable(_)));
    }

    #[test]
    fn issue_outside_window_is_rejected() {
        let mut coupon = open_coupon(1);
        let late = coupon.valid_until + Duration::hours(1);
        let err = coupon.issue(late).unwrap_err();
        assert!(matches!(err, CouponError::OutsideWindow(_)));

        let early = coupon.valid_from - Duration::hours(1);
        let err = coupon.issue(early).unwrap_err();
        assert!(matches!(err, CouponError::OutsideWindow(_)));
    }
}
