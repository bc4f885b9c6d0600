//! Per-user coupon grants.

use chrono::{DateTime, Utc};
use common::{CouponId, GrantId, UserId};
use serde::{Deserialize, Serialize};

/// Usage status of a granted coupon.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GrantStatus {
    Unused,
    Used,
    Expired,
}

/// A coupon granted to a single user.
///
/// The durable record of an issuance. Uniqueness over (user, coupon) is the
/// last line of defence against duplicate issuance and is enforced by the
/// grant store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserCouponGrant {
    pub id: GrantId,
    pub user_id: UserId,
    pub coupon_id: CouponId,
    pub status: GrantStatus,
    pub granted_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
}

impl UserCouponGrant {
    /// Creates an unused grant stamped with the current time.
    pub fn new(user_id: UserId, coupon_id: CouponId) -> Self {
        Self {
            id: GrantId::new(),
            user_id,
            coupon_id,
            status: GrantStatus::Unused,
            granted_at: Utc::now(),
            used_at: None,
        }
    }

    /// Marks the grant used at `now`. Returns false if it was not unused.
    pub fn use_at(&mut self, now: DateTime<Utc>) -> bool {
        if self.status != GrantStatus::Unused {
            return false;
        }
        self.status = GrantStatus::Used;
        self.used_at = Some(now);
        true
    }
}
