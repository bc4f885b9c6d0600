//! Batch commit of admitted issuance requests.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CouponId, UserId};
use concurrency::{LockCoordinator, RetryError, RetryPolicy};
use store::{AtomicStore, StoreError};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::admission::{IssueStatus, ReservationCounter};
use crate::coupon::Coupon;
use crate::error::{CouponError, Result};
use crate::grant::UserCouponGrant;
use crate::store_api::{CouponStore, GrantStore};

/// Tuning knobs for the issuance scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Delay between drain passes.
    pub interval: Duration,
    /// Upper bound on grants committed per coupon per pass.
    pub max_batch: usize,
    /// How long a pass waits for a coupon's lock before skipping it.
    pub lock_wait: Duration,
    /// Lease on the per-coupon lock.
    pub lock_lease: Duration,
    /// Retry budget for version-stamped coupon saves.
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_batch: 100,
            lock_wait: Duration::from_millis(500),
            lock_lease: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Drains waiting queues into durable grants.
///
/// The sole writer of `Coupon.issued_quantity` and of grants. Each pass
/// serializes on a per-coupon lock so two scheduler instances never commit
/// the same queue concurrently; the version-stamped save remains as a second
/// line of defence underneath the lock.
///
/// Ordering per entry is peek, commit, remove: an entry leaves the queue
/// only after its grant is durable (or has failed for good), so a crash
/// between commit and removal is redelivered and caught by the grant
/// uniqueness constraint.
pub struct CouponIssuanceScheduler<A: AtomicStore> {
    coupons: Arc<dyn CouponStore>,
    grants: Arc<dyn GrantStore>,
    admission: ReservationCounter<A>,
    locks: LockCoordinator,
    config: SchedulerConfig,
}

impl<A: AtomicStore> CouponIssuanceScheduler<A> {
    pub fn new(
        coupons: Arc<dyn CouponStore>,
        grants: Arc<dyn GrantStore>,
        admission: ReservationCounter<A>,
        locks: LockCoordinator,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            coupons,
            grants,
            admission,
            locks,
            config,
        }
    }

    /// Runs drain passes at the configured interval until `shutdown` flips
    /// to true or its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.process_pending().await {
                        tracing::error!(error = %e, "issuance pass failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("issuance scheduler stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One drain pass over every active coupon with a non-empty queue.
    /// Returns the number of grants committed.
    #[tracing::instrument(skip(self))]
    pub async fn process_pending(&self) -> Result<usize> {
        let mut committed = 0;
        for coupon in self.coupons.find_active().await? {
            if self.admission.queue_len(coupon.id).await? == 0 {
                continue;
            }

            let key = format!("coupon:issue:{}", coupon.id);
            let guard = match self
                .locks
                .acquire_scoped(&key, self.config.lock_wait, self.config.lock_lease)
                .await
            {
                Ok(guard) => guard,
                Err(e) => {
                    // Another instance holds this coupon; its pass will
                    // drain the queue.
                    tracing::debug!(coupon_id = %coupon.id, error = %e, "skipping locked coupon");
                    continue;
                }
            };

            committed += self.drain_queue(coupon.id).await?;
            drop(guard);
        }
        Ok(committed)
    }

    /// Drains one coupon's queue. Caller must hold the coupon's lock.
    async fn drain_queue(&self, coupon_id: CouponId) -> Result<usize> {
        let now = Utc::now();
        let Some(coupon) = self.coupons.find_by_id(coupon_id).await? else {
            return Ok(0);
        };

        // A coupon that can no longer be issued fails its stragglers
        // instead of leaving them queued forever.
        if let Err(reason) = coupon.check_issuable(now) {
            return self.fail_stragglers(&coupon, &reason).await.map(|()| 0);
        }

        let queued = self.admission.queue_len(coupon_id).await?;
        let batch = queued
            .min(coupon.remaining() as usize)
            .min(self.config.max_batch);
        if batch == 0 {
            return Ok(0);
        }
        metrics::histogram!("coupon_issue_batch_size").record(batch as f64);

        let mut committed = 0;
        for user_id in self.admission.peek_batch(coupon_id, batch).await? {
            match self.commit_entry(coupon_id, user_id, now).await {
                Ok(()) => {
                    self.admission.remove_from_queue(coupon_id, user_id).await?;
                    self.admission
                        .set_status(coupon_id, user_id, IssueStatus::Issued)
                        .await?;
                    metrics::counter!("coupon_grants_committed_total").increment(1);
                    committed += 1;
                }
                Err(CouponError::AlreadyIssued { .. }) => {
                    // The grant is already durable; this entry reserved a
                    // slot it will never use.
                    self.admission.remove_from_queue(coupon_id, user_id).await?;
                    self.admission.rollback_reserve(coupon_id).await?;
                    self.admission
                        .set_status(coupon_id, user_id, IssueStatus::Issued)
                        .await?;
                }
                Err(e) if e.is_business() => {
                    tracing::warn!(%coupon_id, %user_id, error = %e, "issuance failed");
                    self.admission.remove_from_queue(coupon_id, user_id).await?;
                    self.admission.unmark_issued(coupon_id, user_id).await?;
                    self.admission.rollback_reserve(coupon_id).await?;
                    self.admission
                        .set_status(coupon_id, user_id, IssueStatus::Failed)
                        .await?;
                    metrics::counter!("coupon_grants_failed_total").increment(1);
                }
                Err(e) => {
                    // Infrastructure failure: the entry stays queued and is
                    // redelivered on the next pass.
                    tracing::error!(%coupon_id, %user_id, error = %e, "issuance commit failed, will retry");
                    break;
                }
            }
        }

        tracing::debug!(%coupon_id, committed, batch, "queue drained");
        Ok(committed)
    }

    /// Commits one grant: dedup check, versioned coupon save under retry,
    /// grant insert.
    async fn commit_entry(
        &self,
        coupon_id: CouponId,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        if self.grants.exists(user_id, coupon_id).await? {
            return Err(CouponError::AlreadyIssued { coupon_id, user_id });
        }

        let outcome = self
            .config
            .retry
            .run(|| {
                let coupons = Arc::clone(&self.coupons);
                async move {
                    let mut coupon = coupons
                        .find_by_id(coupon_id)
                        .await?
                        .ok_or(CouponError::NotFound(coupon_id))?;
                    coupon.issue(now)?;
                    coupons.save(&coupon).await?;
                    Ok::<(), CouponError>(())
                }
            })
            .await;

        match outcome {
            Ok(()) => {}
            Err(RetryError::Operation(e)) => return Err(e),
            Err(RetryError::Exhausted { attempts, .. }) => {
                return Err(CouponError::Contention { coupon_id, attempts });
            }
            Err(RetryError::Interrupted) => {
                return Err(CouponError::Contention {
                    coupon_id,
                    attempts: 0,
                });
            }
        }

        let grant = UserCouponGrant::new(user_id, coupon_id);
        match self.grants.insert(&grant).await {
            Ok(()) => Ok(()),
            Err(StoreError::UniqueViolation { .. }) => {
                // Another path committed the grant between the dedup check
                // and the insert. Hand back the slot we just consumed.
                self.revoke_issue(coupon_id).await;
                Err(CouponError::AlreadyIssued { coupon_id, user_id })
            }
            Err(e) => {
                self.revoke_issue(coupon_id).await;
                Err(e.into())
            }
        }
    }

    /// Best-effort compensation for an `issue` whose grant failed to
    /// commit.
    async fn revoke_issue(&self, coupon_id: CouponId) {
        let outcome = self
            .config
            .retry
            .run(|| {
                let coupons = Arc::clone(&self.coupons);
                async move {
                    let Some(mut coupon) = coupons.find_by_id(coupon_id).await? else {
                        return Ok(());
                    };
                    coupon.revoke();
                    coupons.save(&coupon).await?;
                    Ok::<(), StoreError>(())
                }
            })
            .await;

        if let Err(e) = outcome {
            tracing::error!(%coupon_id, error = %e, "failed to revoke issuance slot");
        }
    }

    /// Fails every queued entry of a coupon that can no longer be issued.
    async fn fail_stragglers(&self, coupon: &Coupon, reason: &CouponError) -> Result<()> {
        let batch = self
            .admission
            .peek_batch(coupon.id, self.config.max_batch)
            .await?;
        if batch.is_empty() {
            return Ok(());
        }
        tracing::warn!(coupon_id = %coupon.id, count = batch.len(), %reason, "failing queued entries of unissuable coupon");

        for user_id in batch {
            self.admission.remove_from_queue(coupon.id, user_id).await?;
            self.admission.unmark_issued(coupon.id, user_id).await?;
            self.admission.rollback_reserve(coupon.id).await?;
            self.admission
                .set_status(coupon.id, user_id, IssueStatus::Failed)
                .await?;
            metrics::counter!("coupon_grants_failed_total").increment(1);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;
    use common::Money;
    use store::InMemoryAtomicStore;

    use super::*;
    use crate::coupon::DiscountRule;
    use crate::memory::{InMemoryCouponStore, InMemoryGrantStore};
    use crate::service::CouponIssueService;

    struct Fixture {
        scheduler: CouponIssuanceScheduler<InMemoryAtomicStore>,
        service: CouponIssueService<InMemoryAtomicStore>,
        coupons: Arc<InMemoryCouponStore>,
        grants: Arc<InMemoryGrantStore>,
        admission: ReservationCounter<InMemoryAtomicStore>,
        coupon: Coupon,
    }

    async fn fixture(total: u32) -> Fixture {
        let coupons = Arc::new(InMemoryCouponStore::new());
        let grants = Arc::new(InMemoryGrantStore::new());
        let admission = ReservationCounter::new(Arc::new(InMemoryAtomicStore::new()));

        let now = Utc::now();
        let coupon = Coupon::new(
            "drop",
            DiscountRule::Fixed {
                amount: Money::from_dollars(3),
            },
            total,
            now - ChronoDuration::hours(1),
            now + ChronoDuration::hours(1),
        );
        coupons.save(&coupon).await.unwrap();

        let scheduler = CouponIssuanceScheduler::new(
            coupons.clone(),
            grants.clone(),
            admission.clone(),
            LockCoordinator::new(),
            SchedulerConfig::default(),
        );
        let service =
            CouponIssueService::new(coupons.clone(), grants.clone(), admission.clone());

        Fixture {
            scheduler,
            service,
            coupons,
            grants,
            admission,
            coupon,
        }
    }

    #[tokio::test]
    async fn drains_admitted_requests_into_grants() {
        let fx = fixture(5).await;
        let users: Vec<UserId> = (0..3).map(|_| UserId::new()).collect();
        for user in &users {
            fx.service.issue_request(fx.coupon.id, *user).await.unwrap();
        }

        let committed = fx.scheduler.process_pending().await.unwrap();
        assert_eq!(committed, 3);

        let stored = fx.coupons.find_by_id(fx.coupon.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 3);
        for user in &users {
            assert!(fx.grants.exists(*user, fx.coupon.id).await.unwrap());
            assert_eq!(
                fx.admission.status(fx.coupon.id, *user).await.unwrap(),
                IssueStatus::Issued
            );
        }
        assert_eq!(fx.admission.queue_len(fx.coupon.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn batch_respects_remaining_quantity() {
        let fx = fixture(10).await;

        // Two slots already consumed outside this queue.
        let mut stored = fx.coupons.find_by_id(fx.coupon.id).await.unwrap().unwrap();
        stored.issued_quantity = 8;
        fx.coupons.save(&stored).await.unwrap();

        for _ in 0..2 {
            fx.service
                .issue_request(fx.coupon.id, UserId::new())
                .await
                .unwrap();
        }

        let committed = fx.scheduler.process_pending().await.unwrap();
        assert_eq!(committed, 2);
        let after = fx.coupons.find_by_id(fx.coupon.id).await.unwrap().unwrap();
        assert_eq!(after.issued_quantity, 10);
    }

    #[tokio::test]
    async fn pass_is_a_no_op_with_empty_queues() {
        let fx = fixture(5).await;
        assert_eq!(fx.scheduler.process_pending().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn existing_grant_settles_as_issued_without_double_commit() {
        let fx = fixture(5).await;
        let user_id = UserId::new();
        fx.grants
            .insert(&UserCouponGrant::new(user_id, fx.coupon.id))
            .await
            .unwrap();

        fx.service.issue_request(fx.coupon.id, user_id).await.unwrap();
        let committed = fx.scheduler.process_pending().await.unwrap();
        assert_eq!(committed, 0);

        let stored = fx.coupons.find_by_id(fx.coupon.id).await.unwrap().unwrap();
        assert_eq!(stored.issued_quantity, 0);
        assert_eq!(
            fx.admission.status(fx.coupon.id, user_id).await.unwrap(),
            IssueStatus::Issued
        );
        assert_eq!(fx.admission.queue_len(fx.coupon.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn expired_coupon_fails_its_queue() {
        let fx = fixture(5).await;
        let user_id = UserId::new();
        fx.service.issue_request(fx.coupon.id, user_id).await.unwrap();

        // The window closes before the scheduler gets to the entry.
        let mut stored = fx.coupons.find_by_id(fx.coupon.id).await.unwrap().unwrap();
        stored.valid_until = Utc::now() - ChronoDuration::minutes(1);
        fx.coupons.save(&stored).await.unwrap();

        fx.scheduler.process_pending().await.unwrap();
        assert_eq!(
            fx.admission.status(fx.coupon.id, user_id).await.unwrap(),
            IssueStatus::Failed
        );
        assert_eq!(fx.admission.queue_len(fx.coupon.id).await.unwrap(), 0);
        assert_eq!(fx.admission.admitted_count(fx.coupon.id).await.unwrap(), 0);
        assert!(!fx.grants.exists(user_id, fx.coupon.id).await.unwrap());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let fx = fixture(1).await;
        let (tx, rx) = watch::channel(false);

        let scheduler = fx.scheduler;
        let task = tokio::spawn(async move { scheduler.run(rx).await });

        tx.send(true).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), task)
            .await
            .expect("scheduler did not stop")
            .unwrap();
    }
}
