//! Optimistic-concurrency retry wrapper with backoff.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Implemented by error types that can report an optimistic-concurrency
/// version conflict. Only conflicting errors are retried; everything else
/// passes through untouched.
pub trait Conflict {
    /// Returns true if this error is a version conflict.
    fn is_version_conflict(&self) -> bool;
}

/// Delay progression between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// The same delay before every retry.
    Fixed,
    /// `base_delay * 2^(attempt - 1)`.
    Exponential,
}

/// Outcome of a retried unit of work.
#[derive(Debug, Error)]
pub enum RetryError<E>
where
    E: std::error::Error + 'static,
{
    /// Every attempt conflicted; the caller's contention budget ran out.
    #[error("concurrency exhausted after {attempts} conflicting attempts")]
    Exhausted {
        attempts: u32,
        #[source]
        source: E,
    },

    /// A shutdown signal arrived during backoff. The operation is aborted
    /// and never retried post-interruption.
    #[error("retry interrupted during backoff")]
    Interrupted,

    /// The operation failed with a non-conflict error; not retried.
    #[error(transparent)]
    Operation(E),
}

/// Retries a unit of work that may fail on a version conflict.
///
/// Appropriate when contention is rare and state carries a version stamp;
/// use [`crate::LockCoordinator`] instead when contention is expected and
/// must be serialized up front.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (the first call counts as attempt 1).
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Delay progression.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Exponential backoff: `base_delay * 2^(attempt - 1)`.
    pub fn exponential(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Exponential,
        }
    }

    /// Fixed delay between attempts.
    pub fn fixed(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
            backoff: Backoff::Fixed,
        }
    }

    /// Returns the backoff delay after the given (1-based) attempt.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Fixed => self.base_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                self.base_delay.saturating_mul(factor)
            }
        }
    }

    /// Runs `op`, retrying version conflicts up to `max_retries` attempts.
    pub async fn run<T, E, F, Fut>(&self, mut op: F) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Conflict + std::error::Error + 'static,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_version_conflict() => {
                    if attempt >= self.max_retries {
                        tracing::warn!(attempt, "retry budget exhausted");
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let delay = self.delay_for(attempt);
                    tracing::debug!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "version conflict, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(RetryError::Operation(e)),
            }
        }
    }

    /// Like [`run`](Self::run), but aborts with [`RetryError::Interrupted`]
    /// if `shutdown` flips to true (or its sender drops) during backoff.
    pub async fn run_until<T, E, F, Fut>(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        mut op: F,
    ) -> Result<T, RetryError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Conflict + std::error::Error + 'static,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_version_conflict() => {
                    if attempt >= self.max_retries {
                        return Err(RetryError::Exhausted {
                            attempts: attempt,
                            source: e,
                        });
                    }
                    let sleep = tokio::time::sleep(self.delay_for(attempt));
                    tokio::pin!(sleep);
                    loop {
                        tokio::select! {
                            () = &mut sleep => break,
                            changed = shutdown.changed() => {
                                if changed.is_err() || *shutdown.borrow() {
                                    tracing::debug!(attempt, "retry interrupted during backoff");
                                    return Err(RetryError::Interrupted);
                                }
                            }
                        }
                    }
                }
                Err(e) => return Err(RetryError::Operation(e)),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(50))
    }
}
