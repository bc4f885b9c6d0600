//! Shared-counter admission for coupon issuance.
//!
//! Exclusive owner of the coupon keys in the shared atomic store: the
//! admission counter, the issued-user dedup set, the waiting queue, and the
//! per-request status keys. No other component touches these keys.

use std::sync::Arc;
use std::time::Duration;

use common::{CouponId, UserId};
use store::{AtomicStore, Result, StoreError};

/// How long a request's status key stays readable after it settles.
const STATUS_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Status of an issuance request as seen by the requesting user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueStatus {
    /// Admitted and waiting for the scheduler to commit the grant.
    Pending,
    /// The grant is durable.
    Issued,
    /// The request failed after admission (expired, exhausted, duplicate).
    Failed,
    /// No admission record exists for this (coupon, user) pair.
    NotRequested,
}

impl IssueStatus {
    fn as_str(&self) -> &'static str {
        match self {
            IssueStatus::Pending => "PENDING",
            IssueStatus::Issued => "ISSUED",
            IssueStatus::Failed => "FAILED",
            IssueStatus::NotRequested => "NOT_REQUESTED",
        }
    }

    fn parse(raw: &str) -> Result<Self> {
        match raw {
            "PENDING" => Ok(IssueStatus::Pending),
            "ISSUED" => Ok(IssueStatus::Issued),
            "FAILED" => Ok(IssueStatus::Failed),
            other => Err(StoreError::Backend(format!(
                "corrupt issue status value: {other}"
            ))),
        }
    }
}

impl std::fmt::Display for IssueStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Admission gate over the shared atomic store.
///
/// `reserve` admits at most `limit` requests per coupon via a single atomic
/// increment; every later step has a compensating operation so that a
/// downstream failure returns the slot instead of leaking it.
#[derive(Clone)]
pub struct ReservationCounter<A: AtomicStore> {
    store: Arc<A>,
}

fn counter_key(coupon_id: CouponId) -> String {
    format!("coupon:{coupon_id}:counter")
}

fn issued_set_key(coupon_id: CouponId) -> String {
    format!("coupon:{coupon_id}:issued:users")
}

fn queue_key(coupon_id: CouponId) -> String {
    format!("coupon:{coupon_id}:waiting:queue")
}

fn status_key(coupon_id: CouponId, user_id: UserId) -> String {
    format!("coupon:{coupon_id}:user:{user_id}:status")
}

impl<A: AtomicStore> ReservationCounter<A> {
    pub fn new(store: Arc<A>) -> Self {
        Self { store }
    }

    /// Claims an issuance slot. Returns the admission sequence number if the
    /// post-increment count is within `limit`; otherwise issues the
    /// compensating decrement and returns `None`.
    pub async fn reserve(&self, coupon_id: CouponId, limit: u32) -> Result<Option<i64>> {
        let sequence = self.store.increment(&counter_key(coupon_id)).await?;
        if sequence > i64::from(limit) {
            self.store.decrement(&counter_key(coupon_id)).await?;
            return Ok(None);
        }
        Ok(Some(sequence))
    }

    /// Returns a previously reserved slot.
    pub async fn rollback_reserve(&self, coupon_id: CouponId) -> Result<()> {
        self.store.decrement(&counter_key(coupon_id)).await?;
        Ok(())
    }

    /// Marks the user as having claimed this coupon. Returns true iff the
    /// user was newly added; false means a duplicate request and the caller
    /// must roll back the reserve it just won.
    pub async fn check_and_mark_issued(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<bool> {
        self.store
            .set_add(&issued_set_key(coupon_id), &user_id.to_string())
            .await
    }

    /// Removes the user's dedup mark.
    pub async fn unmark_issued(&self, coupon_id: CouponId, user_id: UserId) -> Result<()> {
        self.store
            .set_remove(&issued_set_key(coupon_id), &user_id.to_string())
            .await?;
        Ok(())
    }

    /// Appends the user to the waiting queue, ordered by admission sequence.
    pub async fn enqueue(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        sequence: i64,
    ) -> Result<()> {
        self.store
            .sorted_add(&queue_key(coupon_id), &user_id.to_string(), sequence)
            .await?;
        Ok(())
    }

    /// Returns up to `max` waiting users in admission order without
    /// removing them. Entries leave the queue only after their grant is
    /// durable (or has failed for good).
    pub async fn peek_batch(&self, coupon_id: CouponId, max: usize) -> Result<Vec<UserId>> {
        let entries = self.store.sorted_range(&queue_key(coupon_id), max).await?;
        entries
            .into_iter()
            .map(|(member, _)| {
                member.parse().map_err(|_| {
                    StoreError::Backend(format!("corrupt waiting queue member: {member}"))
                })
            })
            .collect()
    }

    /// Removes a settled entry from the waiting queue.
    pub async fn remove_from_queue(&self, coupon_id: CouponId, user_id: UserId) -> Result<()> {
        self.store
            .sorted_remove(&queue_key(coupon_id), &user_id.to_string())
            .await?;
        Ok(())
    }

    /// Number of users still waiting for commit.
    pub async fn queue_len(&self, coupon_id: CouponId) -> Result<usize> {
        self.store.sorted_len(&queue_key(coupon_id)).await
    }

    /// Current admitted count (the counter value).
    pub async fn admitted_count(&self, coupon_id: CouponId) -> Result<i64> {
        self.store.counter(&counter_key(coupon_id)).await
    }

    /// 0-based queue position of a waiting user, or `None` if not queued.
    pub async fn waiting_rank(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
    ) -> Result<Option<usize>> {
        self.store
            .sorted_rank(&queue_key(coupon_id), &user_id.to_string())
            .await
    }

    /// Writes the request status key (24h TTL).
    pub async fn set_status(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        status: IssueStatus,
    ) -> Result<()> {
        self.store
            .put(
                &status_key(coupon_id, user_id),
                status.as_str(),
                Some(STATUS_TTL),
            )
            .await
    }

    /// Reads the request status key.
    pub async fn status(&self, coupon_id: CouponId, user_id: UserId) -> Result<IssueStatus> {
        match self.store.get(&status_key(coupon_id, user_id)).await? {
            Some(raw) => IssueStatus::parse(&raw),
            None => Ok(IssueStatus::NotRequested),
        }
    }

    /// Drops every admission key for a coupon. Used when a campaign is
    /// deleted or reset.
    pub async fn reset(&self, coupon_id: CouponId) -> Result<()> {
        self.store.delete(&counter_key(coupon_id)).await?;
        self.store.delete(&issued_set_key(coupon_id)).await?;
        self.store.delete(&queue_key(coupon_id)).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use store::InMemoryAtomicStore;

    use super::*;

    fn counter() -> ReservationCounter<InMemoryAtomicStore> {
        ReservationCounter::new(Arc::new(InMemoryAtomicStore::new()))
    }

    #[tokio::test]
    async fn reserve_admits_up_to_limit() {
        let admission = counter();
        let coupon_id = CouponId::new();

        assert_eq!(admission.reserve(coupon_id, 2).await.unwrap(), Some(1));
        assert_eq!(admission.reserve(coupon_id, 2).await.unwrap(), Some(2));
        assert_eq!(admission.reserve(coupon_id, 2).await.unwrap(), None);
        // The rejected attempt compensated its increment.
        assert_eq!(admission.admitted_count(coupon_id).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn rollback_frees_a_slot() {
        let admission = counter();
        let coupon_id = CouponId::new();

        admission.reserve(coupon_id, 1).await.unwrap();
        assert_eq!(admission.reserve(coupon_id, 1).await.unwrap(), None);

        admission.rollback_reserve(coupon_id).await.unwrap();
        assert_eq!(admission.reserve(coupon_id, 1).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn dedup_mark_fires_once_per_user() {
        let admission = counter();
        let coupon_id = CouponId::new();
        let user_id = UserId::new();

        assert!(
            admission
                .check_and_mark_issued(coupon_id, user_id)
                .await
                .unwrap()
        );
        assert!(
            !admission
                .check_and_mark_issued(coupon_id, user_id)
                .await
                .unwrap()
        );

        admission.unmark_issued(coupon_id, user_id).await.unwrap();
        assert!(
            admission
                .check_and_mark_issued(coupon_id, user_id)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn queue_preserves_admission_order() {
        let admission = counter();
        let coupon_id = CouponId::new();
        let first = UserId::new();
        let second = UserId::new();

        // Enqueued out of arrival order; the sequence decides.
        admission.enqueue(coupon_id, second, 2).await.unwrap();
        admission.enqueue(coupon_id, first, 1).await.unwrap();

        let batch = admission.peek_batch(coupon_id, 10).await.unwrap();
        assert_eq!(batch, vec![first, second]);

        // Peek does not drain.
        assert_eq!(admission.queue_len(coupon_id).await.unwrap(), 2);
        assert_eq!(
            admission.waiting_rank(coupon_id, second).await.unwrap(),
            Some(1)
        );

        admission.remove_from_queue(coupon_id, first).await.unwrap();
        assert_eq!(admission.queue_len(coupon_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn status_roundtrip() {
        let admission = counter();
        let coupon_id = CouponId::new();
        let user_id = UserId::new();

        assert_eq!(
            admission.status(coupon_id, user_id).await.unwrap(),
            IssueStatus::NotRequested
        );

        admission
            .set_status(coupon_id, user_id, IssueStatus::Pending)
            .await
            .unwrap();
        assert_eq!(
            admission.status(coupon_id, user_id).await.unwrap(),
            IssueStatus::Pending
        );

        admission
            .set_status(coupon_id, user_id, IssueStatus::Issued)
            .await
            .unwrap();
        assert_eq!(
            admission.status(coupon_id, user_id).await.unwrap(),
            IssueStatus::Issued
        );
    }

    #[tokio::test]
    async fn reset_clears_all_keys() {
        let admission = counter();
        let coupon_id = CouponId::new();
        let user_id = UserId::new();

        admission.reserve(coupon_id, 10).await.unwrap();
        admission
            .check_and_mark_issued(coupon_id, user_id)
            .await
            .unwrap();
        admission.enqueue(coupon_id, user_id, 1).await.unwrap();

        admission.reset(coupon_id).await.unwrap();
        assert_eq!(admission.admitted_count(coupon_id).await.unwrap(), 0);
        assert_eq!(admission.queue_len(coupon_id).await.unwrap(), 0);
        assert!(
            admission
                .check_and_mark_issued(coupon_id, user_id)
                .await
                .unwrap()
        );
    }
}
