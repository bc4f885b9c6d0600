//! Repository ports for coupons and grants.

use async_trait::async_trait;
use common::{CouponId, UserId};
use store::Result;

use crate::coupon::Coupon;
use crate::grant::UserCouponGrant;

/// Durable storage for coupon campaigns.
///
/// `save` is version-stamped: the write succeeds only if the stored version
/// matches `coupon.version`, and the stored row advances to
/// `coupon.version.next()`. A mismatch is `StoreError::VersionConflict`.
#[async_trait]
pub trait CouponStore: Send + Sync {
    async fn save(&self, coupon: &Coupon) -> Result<()>;
    async fn find_by_id(&self, id: CouponId) -> Result<Option<Coupon>>;
    async fn find_active(&self) -> Result<Vec<Coupon>>;
}

/// Durable storage for per-user grants.
///
/// `insert` enforces uniqueness over (user, coupon); a duplicate is
/// `StoreError::UniqueViolation`.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert(&self, grant: &UserCouponGrant) -> Result<()>;
    async fn exists(&self, user_id: UserId, coupon_id: CouponId) -> Result<bool>;
    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<UserCouponGrant>>;
}
