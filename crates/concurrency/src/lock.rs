//! Keyed lock coordinator with wait and lease timeouts.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::error::LockError;

/// Serializes critical sections keyed by an arbitrary string.
///
/// `acquire` blocks up to a wait timeout; a held lock expires after its
/// lease timeout, so a crashed holder can never wedge a key forever.
/// Release is idempotent and token-fenced: releasing a stale handle (after
/// lease expiry, or after another holder took over) is a no-op.
///
/// The registry of keys is pruned whenever a key has neither holder nor
/// waiters, so it stays bounded under many distinct resource ids. The
/// coordinator is cheap to clone; clones share one registry.
#[derive(Clone, Default)]
pub struct LockCoordinator {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    slots: Mutex<HashMap<String, Slot>>,
    next_token: AtomicU64,
}

struct Slot {
    holder: Option<Holder>,
    waiters: usize,
    notify: Arc<Notify>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            holder: None,
            waiters: 0,
            notify: Arc::new(Notify::new()),
        }
    }
}

struct Holder {
    token: u64,
    expires_at: Instant,
}

/// Proof of a successful acquisition, required to release.
#[derive(Debug)]
pub struct LockHandle {
    key: String,
    token: u64,
}

impl LockHandle {
    /// Returns the key this handle locks.
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl LockCoordinator {
    /// Creates a new coordinator with an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the lock for `key`, blocking up to `wait`.
    ///
    /// The lock is held for at most `lease`; after that waiters may take
    /// over even without a release. On timeout no side effects have
    /// occurred — the caller's critical section never ran.
    pub async fn acquire(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockHandle, LockError> {
        let deadline = Instant::now() + wait;

        loop {
            let (notify, holder_expiry) = {
                let mut slots = self.inner.slots.lock().unwrap();
                let slot = slots.entry(key.to_string()).or_default();
                let now = Instant::now();

                match &slot.holder {
                    Some(holder) if holder.expires_at > now => {
                        slot.waiters += 1;
                        (Arc::clone(&slot.notify), holder.expires_at)
                    }
                    _ => {
                        // Free, or the previous holder's lease ran out.
                        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
                        slot.holder = Some(Holder {
                            token,
                            expires_at: now + lease,
                        });
                        tracing::trace!(key, token, "lock acquired");
                        return Ok(LockHandle {
                            key: key.to_string(),
                            token,
                        });
                    }
                }
            };

            let now = Instant::now();
            if now >= deadline {
                self.forget_waiter(key);
                tracing::debug!(key, ?wait, "lock acquisition timed out");
                return Err(LockError::Timeout {
                    key: key.to_string(),
                    waited: wait,
                });
            }

            // Wake on release, on the holder's lease running out, or at our
            // own deadline, whichever comes first. Wakeups are advisory;
            // correctness comes from re-checking the slot at the loop top.
            let wake_at = deadline.min(holder_expiry);
            let _ = tokio::time::timeout(
                wake_at.saturating_duration_since(now),
                notify.notified(),
            )
            .await;
            self.forget_waiter(key);
        }
    }

    /// Releases the lock held by `handle`.
    ///
    /// Idempotent: releasing twice, or after the lease expired and another
    /// caller took over, is a no-op.
    pub fn release(&self, handle: &LockHandle) {
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&handle.key) {
            if slot
                .holder
                .as_ref()
                .is_some_and(|h| h.token == handle.token)
            {
                slot.holder = None;
                slot.notify.notify_one();
                tracing::trace!(key = %handle.key, token = handle.token, "lock released");
            }
            if slot.holder.is_none() && slot.waiters == 0 {
                slots.remove(&handle.key);
            }
        }
    }

    /// Acquires the lock and returns a guard that releases it on drop —
    /// on normal return, on error, and on cancellation alike.
    pub async fn acquire_scoped(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
    ) -> Result<LockGuard, LockError> {
        let handle = self.acquire(key, wait, lease).await?;
        Ok(LockGuard {
            coordinator: self.clone(),
            handle: Some(handle),
        })
    }

    /// Runs `f` under the lock for `key`, releasing on every exit path.
    pub async fn with_lock<T, E, F, Fut>(
        &self,
        key: &str,
        wait: Duration,
        lease: Duration,
        f: F,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<LockError>,
    {
        let _guard = self.acquire_scoped(key, wait, lease).await?;
        f().await
    }

    fn forget_waiter(&self, key: &str) {
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(key) {
            slot.waiters = slot.waiters.saturating_sub(1);
            let expired = slot
                .holder
                .as_ref()
                .is_none_or(|h| h.expires_at <= Instant::now());
            if expired && slot.waiters == 0 && slot.holder.is_none() {
                slots.remove(key);
            }
        }
    }

    /// Number of keys currently tracked (held or waited on).
    pub fn tracked_keys(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }
}

/// RAII guard returned by [`LockCoordinator::acquire_scoped`].
pub struct LockGuard {
    coordinator: LockCoordinator,
    handle: Option<LockHandle>,
}

impl LockGuard {
    /// Returns the key this guard locks.
    pub fn key(&self) -> &str {
        self.handle.as_ref().map(|h| h.key()).unwrap_or_default()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.coordinator.release(&handle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAIT: Duration = Duration::from_millis(100);
    const LEASE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn acquire_and_release() {
        let locks = LockCoordinator::new();
        let handle = locks.acquire("a", WAIT, LEASE).await.unwrap();
        locks.release(&handle);
        assert_eq!(locks.tracked_keys(), 0);
    }

    #[tokio::test]
    async fn second_acquire_times_out_while_held() {
        let locks = LockCoordinator::new();
        let _handle = locks.acquire("a", WAIT, LEASE).await.unwrap();

        let result = locks.acquire("a", Duration::from_millis(50), LEASE).await;
        assert!(matches!(result, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn different_keys_do_not_contend() {
        let locks = LockCoordinator::new();
        let _a = locks.acquire("a", WAIT, LEASE).await.unwrap();
        let b = locks.acquire("b", WAIT, LEASE).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn waiter_acquires_after_release() {
        let locks = LockCoordinator::new();
        let handle = locks.acquire("a", WAIT, LEASE).await.unwrap();

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            locks2.acquire("a", Duration::from_secs(2), LEASE).await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        locks.release(&handle);

        let acquired = waiter.await.unwrap();
        assert!(acquired.is_ok());
    }

    #[tokio::test]
    async fn lease_expiry_allows_takeover() {
        let locks = LockCoordinator::new();
        let stale = locks
            .acquire("a", WAIT, Duration::from_millis(30))
            .await
            .unwrap();

        // Holder never releases; lease runs out and the waiter takes over.
        let taken = locks.acquire("a", Duration::from_secs(1), LEASE).await;
        assert!(taken.is_ok());

        // The stale handle's release must not free the new holder's lock.
        locks.release(&stale);
        let blocked = locks.acquire("a", Duration::from_millis(30), LEASE).await;
        assert!(matches!(blocked, Err(LockError::Timeout { .. })));
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let locks = LockCoordinator::new();
        let handle = locks.acquire("a", WAIT, LEASE).await.unwrap();
        locks.release(&handle);
        locks.release(&handle);
        assert!(locks.acquire("a", WAIT, LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn guard_releases_on_drop() {
        let locks = LockCoordinator::new();
        {
            let _guard = locks.acquire_scoped("a", WAIT, LEASE).await.unwrap();
            let blocked = locks.acquire("a", Duration::from_millis(20), LEASE).await;
            assert!(blocked.is_err());
        }
        assert!(locks.acquire("a", WAIT, LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn guard_releases_on_cancellation() {
        let locks = LockCoordinator::new();
        let locks2 = locks.clone();

        let task = tokio::spawn(async move {
            let _guard = locks2.acquire_scoped("a", WAIT, LEASE).await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        task.abort();
        let _ = task.await;

        assert!(locks.acquire("a", Duration::from_secs(1), LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn with_lock_releases_on_error() {
        #[derive(Debug, thiserror::Error)]
        enum TestError {
            #[error("boom")]
            Boom,
            #[error(transparent)]
            Lock(#[from] LockError),
        }

        let locks = LockCoordinator::new();
        let result: Result<(), TestError> = locks
            .with_lock("a", WAIT, LEASE, || async { Err(TestError::Boom) })
            .await;
        assert!(matches!(result, Err(TestError::Boom)));

        assert!(locks.acquire("a", WAIT, LEASE).await.is_ok());
    }

    #[tokio::test]
    async fn registry_is_pruned() {
        let locks = LockCoordinator::new();
        for i in 0..100 {
            let handle = locks
                .acquire(&format!("key-{i}"), WAIT, LEASE)
                .await
                .unwrap();
            locks.release(&handle);
        }
        assert_eq!(locks.tracked_keys(), 0);
    }
}
