//! PostgreSQL-backed coupon and grant repositories.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CouponId, GrantId, UserId, Version};
use sqlx::{PgPool, Row, postgres::PgRow};
use store::{Result, StoreError};
use uuid::Uuid;

use crate::coupon::{Coupon, CouponStatus};
use crate::grant::{GrantStatus, UserCouponGrant};
use crate::store_api::{CouponStore, GrantStore};

/// PostgreSQL [`CouponStore`] with version-stamped saves.
#[derive(Clone)]
pub struct PostgresCouponStore {
    pool: PgPool,
}

impl PostgresCouponStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_coupon(row: PgRow) -> Result<Coupon> {
        let discount = serde_json::from_value(row.try_get("discount")?)?;
        let status = match row.try_get::<&str, _>("status")? {
            "ACTIVE" => CouponStatus::Active,
            "INACTIVE" => CouponStatus::Inactive,
            "DELETED" => CouponStatus::Deleted,
            other => {
                return Err(StoreError::Backend(format!(
                    "corrupt coupon status: {other}"
                )));
            }
        };

        Ok(Coupon {
            id: CouponId::from_uuid(row.try_get::<Uuid, _>("id")?),
            name: row.try_get("name")?,
            discount,
            total_quantity: row.try_get::<i32, _>("total_quantity")? as u32,
            issued_quantity: row.try_get::<i32, _>("issued_quantity")? as u32,
            valid_from: row.try_get("valid_from")?,
            valid_until: row.try_get("valid_until")?,
            status,
            version: Version::new(row.try_get("version")?),
        })
    }

    fn status_str(status: CouponStatus) -> &'static str {
        match status {
            CouponStatus::Active => "ACTIVE",
            CouponStatus::Inactive => "INACTIVE",
            CouponStatus::Deleted => "DELETED",
        }
    }
}

#[async_trait]
impl CouponStore for PostgresCouponStore {
    async fn save(&self, coupon: &Coupon) -> Result<()> {
        let discount = serde_json::to_value(coupon.discount)?;
        let result = sqlx::query(
            r#"
            INSERT INTO coupons
                (id, name, discount, total_quantity, issued_quantity,
                 valid_from, valid_until, status, version)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                discount = EXCLUDED.discount,
                total_quantity = EXCLUDED.total_quantity,
                issued_quantity = EXCLUDED.issued_quantity,
                valid_from = EXCLUDED.valid_from,
                valid_until = EXCLUDED.valid_until,
                status = EXCLUDED.status,
                version = EXCLUDED.version
            WHERE coupons.version = $10
            "#,
        )
        .bind(coupon.id.as_uuid())
        .bind(&coupon.name)
        .bind(discount)
        .bind(coupon.total_quantity as i32)
        .bind(coupon.issued_quantity as i32)
        .bind(coupon.valid_from)
        .bind(coupon.valid_until)
        .bind(Self::status_str(coupon.status))
        .bind(coupon.version.next().as_i64())
        .bind(coupon.version.as_i64())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            let actual: i64 = sqlx::query_scalar("SELECT version FROM coupons WHERE id = $1")
                .bind(coupon.id.as_uuid())
                .fetch_one(&self.pool)
                .await?;
            return Err(StoreError::VersionConflict {
                entity: "coupon",
                id: coupon.id.to_string(),
                expected: coupon.version,
                actual: Version::new(actual),
            });
        }
        Ok(())
    }

    async fn find_by_id(&self, id: CouponId) -> Result<Option<Coupon>> {
        let row = sqlx::query(
            r#"
            SELECT id, name, discount, total_quantity, issued_quantity,
                   valid_from, valid_until, status, version
            FROM coupons
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Self::row_to_coupon).transpose()
    }

    async fn find_active(&self) -> Result<Vec<Coupon>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, discount, total_quantity, issued_quantity,
                   valid_from, valid_until, status, version
            FROM coupons
            WHERE status = 'ACTIVE'
            ORDER BY valid_from ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_coupon).collect()
    }
}

/// PostgreSQL [`GrantStore`]; (user, coupon) uniqueness is enforced by the
/// `uq_grant_user_coupon` constraint.
#[derive(Clone)]
pub struct PostgresGrantStore {
    pool: PgPool,
}

impl PostgresGrantStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_grant(row: PgRow) -> Result<UserCouponGrant> {
        let status = match row.try_get::<&str, _>("status")? {
            "UNUSED" => GrantStatus::Unused,
            "USED" => GrantStatus::Used,
            "EXPIRED" => GrantStatus::Expired,
            other => {
                return Err(StoreError::Backend(format!(
                    "corrupt grant status: {other}"
                )));
            }
        };

        Ok(UserCouponGrant {
            id: GrantId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            coupon_id: CouponId::from_uuid(row.try_get::<Uuid, _>("coupon_id")?),
            status,
            granted_at: row.try_get::<DateTime<Utc>, _>("granted_at")?,
            used_at: row.try_get("used_at")?,
        })
    }

    fn status_str(status: GrantStatus) -> &'static str {
        match status {
            GrantStatus::Unused => "UNUSED",
            GrantStatus::Used => "USED",
            GrantStatus::Expired => "EXPIRED",
        }
    }
}

#[async_trait]
impl GrantStore for PostgresGrantStore {
    async fn insert(&self, grant: &UserCouponGrant) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO user_coupon_grants (id, user_id, coupon_id, status, granted_at, used_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(grant.id.as_uuid())
        .bind(grant.user_id.as_uuid())
        .bind(grant.coupon_id.as_uuid())
        .bind(Self::status_str(grant.status))
        .bind(grant.granted_at)
        .bind(grant.used_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(ref db_err) = e
                && db_err.constraint() == Some("uq_grant_user_coupon")
            {
                return StoreError::UniqueViolation {
                    entity: "user_coupon_grant",
                    detail: format!(
                        "user {} already holds coupon {}",
                        grant.user_id, grant.coupon_id
                    ),
                };
            }
            StoreError::Database(e)
        })?;
        Ok(())
    }

    async fn exists(&self, user_id: UserId, coupon_id: CouponId) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM user_coupon_grants WHERE user_id = $1 AND coupon_id = $2)",
        )
        .bind(user_id.as_uuid())
        .bind(coupon_id.as_uuid())
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn find_by_user(&self, user_id: UserId) -> Result<Vec<UserCouponGrant>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, coupon_id, status, granted_at, used_at
            FROM user_coupon_grants
            WHERE user_id = $1
            ORDER BY granted_at ASC
            "#,
        )
        .bind(user_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(Self::row_to_grant).collect()
    }
}
