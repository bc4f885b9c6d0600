//! Synchronous face of coupon issuance.

use std::sync::Arc;

use chrono::Utc;
use common::{CouponId, UserId};
use store::AtomicStore;

use crate::admission::{IssueStatus, ReservationCounter};
use crate::error::{CouponError, Result};
use crate::store_api::{CouponStore, GrantStore};

/// Handles issuance requests and status queries.
///
/// A successful `issue_request` means the user holds a slot and will be
/// granted the coupon by the scheduler; it does not mean the grant is
/// durable yet. The pipeline is reserve → dedup-mark → enqueue → status
/// PENDING, and every step that fails compensates the steps before it so a
/// failed request never consumes quantity.
pub struct CouponIssueService<A: AtomicStore> {
    coupons: Arc<dyn CouponStore>,
    grants: Arc<dyn GrantStore>,
    admission: ReservationCounter<A>,
}

impl<A: AtomicStore> CouponIssueService<A> {
    pub fn new(
        coupons: Arc<dyn CouponStore>,
        grants: Arc<dyn GrantStore>,
        admission: ReservationCounter<A>,
    ) -> Self {
        Self {
            coupons,
            grants,
            admission,
        }
    }

    /// Requests issuance of `coupon_id` to `user_id`.
    ///
    /// Rejections are final for this request; a sold-out answer is never
    /// revisited even if a later compensation frees a slot.
    #[tracing::instrument(skip(self), fields(%coupon_id, %user_id))]
    pub async fn issue_request(&self, coupon_id: CouponId, user_id: UserId) -> Result<()> {
        let coupon = self
            .coupons
            .find_by_id(coupon_id)
            .await?
            .ok_or(CouponError::NotFound(coupon_id))?;
        coupon.check_issuable(Utc::now())?;

        let Some(sequence) = self.admission.reserve(coupon_id, coupon.total_quantity).await? else {
            metrics::counter!("coupon_issue_rejected_total", "reason" => "sold_out").increment(1);
            return Err(CouponError::SoldOut(coupon_id));
        };

        if !self.admission.check_and_mark_issued(coupon_id, user_id).await? {
            self.admission.rollback_reserve(coupon_id).await?;
            metrics::counter!("coupon_issue_rejected_total", "reason" => "duplicate").increment(1);
            return Err(CouponError::AlreadyIssued { coupon_id, user_id });
        }

        if let Err(e) = self.admission.enqueue(coupon_id, user_id, sequence).await {
            self.admission.unmark_issued(coupon_id, user_id).await?;
            self.admission.rollback_reserve(coupon_id).await?;
            return Err(e.into());
        }

        if let Err(e) = self
            .admission
            .set_status(coupon_id, user_id, IssueStatus::Pending)
            .await
        {
            self.admission.remove_from_queue(coupon_id, user_id).await?;
            self.admission.unmark_issued(coupon_id, user_id).await?;
            self.admission.rollback_reserve(coupon_id).await?;
            return Err(e.into());
        }

        metrics::counter!("coupon_issue_admitted_total").increment(1);
        tracing::info!(sequence, "issuance request admitted");
        Ok(())
    }

    /// Reports the status of a prior issuance request.
    ///
    /// The status key expires after 24 hours, so the durable grant store is
    /// consulted as a fallback before answering NOT_REQUESTED.
    #[tracing::instrument(skip(self), fields(%coupon_id, %user_id))]
    pub async fn issue_status(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<IssueStatus> {
        let status = self.admission.status(coupon_id, user_id).await?;
        if status != IssueStatus::NotRequested {
            return Ok(status);
        }
        if self.grants.exists(user_id, coupon_id).await? {
            return Ok(IssueStatus::Issued);
        }
        Ok(IssueStatus::NotRequested)
    }

    /// Queue position of a pending request (0-based), if still queued.
    pub async fn waiting_rank(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<Option<usize>> {
        Ok(self.admission.waiting_rank(coupon_id, user_id).await?)
    }
}
