//! Port for the externally shared, atomically operable store.

use std::time::Duration;

use async_trait::async_trait;

use crate::Result;

/// Atomic key-value operations shared across all service instances.
///
/// Every operation is a single atomic round trip against the backing store.
/// The coupon admission pipeline depends on exactly this surface: counters
/// for the quantity gate, sets for per-user dedup, sorted sets for the
/// waiting queue, and TTL'd values for request status.
///
/// All implementations must be thread-safe (`Send + Sync`).
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Atomically increments the counter at `key`, returning the new value.
    /// A missing counter starts at 0.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Atomically decrements the counter at `key`, returning the new value.
    async fn decrement(&self, key: &str) -> Result<i64>;

    /// Reads the counter at `key` (0 if absent).
    async fn counter(&self, key: &str) -> Result<i64>;

    /// Adds `member` to the set at `key`. Returns true iff it was newly
    /// added.
    async fn set_add(&self, key: &str, member: &str) -> Result<bool>;

    /// Removes `member` from the set at `key`. Returns true iff it was
    /// present.
    async fn set_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns true if `member` is in the set at `key`.
    async fn set_contains(&self, key: &str, member: &str) -> Result<bool>;

    /// Adds `member` with `score` to the sorted set at `key`. Returns true
    /// iff it was newly added; an existing member keeps its original score.
    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<bool>;

    /// Returns up to `limit` members with the lowest scores, in score
    /// order, without removing them.
    async fn sorted_range(&self, key: &str, limit: usize) -> Result<Vec<(String, i64)>>;

    /// Removes `member` from the sorted set at `key`. Returns true iff it
    /// was present.
    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool>;

    /// Returns the number of members in the sorted set at `key`.
    async fn sorted_len(&self, key: &str) -> Result<usize>;

    /// Returns the 0-based rank of `member` in score order, or `None` if
    /// absent.
    async fn sorted_rank(&self, key: &str, member: &str) -> Result<Option<usize>>;

    /// Reads the value at `key`, honouring any TTL.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Writes `value` at `key`, optionally expiring after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Deletes the value, counter, set, or sorted set at `key`.
    async fn delete(&self, key: &str) -> Result<()>;
}
