//! Concurrency-control primitives for contended resources.
//!
//! Two complementary tools, chosen per call site:
//! - [`LockCoordinator`] serializes a critical section up front. Appropriate
//!   when contention is expected (per-product stock mutation, per-coupon
//!   batch commits).
//! - [`RetryPolicy`] retries a unit of work that failed on a version
//!   conflict. Appropriate when contention is rare and the state carries a
//!   version stamp.

pub mod error;
pub mod lock;
pub mod retry;

pub use error::LockError;
pub use lock::{LockCoordinator, LockGuard, LockHandle};
pub use retry::{Backoff, Conflict, RetryError, RetryPolicy};
