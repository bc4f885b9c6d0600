//! In-memory repositories for tests and single-process deployments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{CouponId, UserId};
use store::{Result, StoreError};

use crate::coupon::{Coupon, CouponStatus};
use crate::grant::UserCouponGrant;
use crate::store_api::{CouponStore, GrantStore};

/// In-memory [`CouponStore`] with the same version-stamp semantics as the
/// PostgreSQL implementation.
#[derive(Clone, Default)]
pub struct InMemoryCouponStore {
    coupons: Arc<RwLock<HashMap<CouponId, Coupon>>>,
}

impl InMemoryCouponStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CouponStore for InMemoryCouponStore {
    async fn save(&self, coupon: &Coupon) -> Result<()> {
        let mut coupons = self.coupons.write().unwrap();
        match coupons.get(&coupon.id) {
            Some(stored) if stored.version != coupon.version => {
                return Err(StoreError::VersionConflict {
                    entity: "coupon",
                    id: coupon.id.to_string(),
                    expected: coupon.version,
                    actual: stored.version,
                });
            }
            _ => {}
        }
        let mut saved = coupon.clone();
        saved.version = coupon.version.next();
        coupons.insert(coupon.id, saved);
        Ok(())
    }

    async fn find_by_id(&self, id: CouponId) -> Result<Option<Coupon>> {
        Ok(self.coupons.read().unwrap().get(&id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<Coupon>> {
        Ok(self
            .coupons
            .read()
            .unwrap()
            .values()
            .filter(|c| c.status == CouponStatus::Active)
            .cloned()
            .collect())
    }
}

/// In-memory [`GrantStore`] enforcing (user, coupon) uniqueness.
#[derive(Clone, Default)]
pub struct InMemoryGrantStore {
    grants: Arc<RwLock<Vec<UserCouponGrant>>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn insert(&self, grant: &UserCouponGrant) -> Result<()> {
        let mut grants = self.grants.write().unwrap();
        if grants
            .iter()
            .any(|g| g.user_id == grant.user_id && g.coupon_id == grant.coupon_id)
        {
            return Err(StoreError::UniqueViolation {
                entity: "user_coupon_grant",
                detail: format!("user {} already holds coupon {}", grant.user_id, grant.coupon_id),
            });
        }
        grants.push(grant.clone());
        Ok(())
    }

    async fn exists(&self, user_id: UserId, coupon_id: CouponId) -> Result<bool> {
        Ok(self
            .grants
            .read()
            .unwrap()
            .iter()
            .any(|g| g.user_id == user_id && g.coupon_id == coupon_id))
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<UserCouponGrant>> {
        Ok(self
            .grants
            .read()
            .unwrap()
            .iter()
            .filter(|g| g.user_id == user_id)
            .cloned()
            .collect())
    }
}
