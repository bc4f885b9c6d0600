//! In-memory implementation of the shared atomic store.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::atomic::AtomicStore;
use crate::{Result, StoreError};

#[derive(Default)]
struct SortedSet {
    by_score: BTreeSet<(i64, String)>,
    scores: HashMap<String, i64>,
}

#[derive(Default)]
struct Inner {
    counters: HashMap<String, i64>,
    sets: HashMap<String, HashSet<String>>,
    sorted: HashMap<String, SortedSet>,
    values: HashMap<String, (String, Option<Instant>)>,
}

/// In-memory [`AtomicStore`] for tests and single-process deployments.
///
/// Provides the same atomicity guarantees as the external store within one
/// process: every operation takes the write lock for its full duration.
#[derive(Clone, Default)]
pub struct InMemoryAtomicStore {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryAtomicStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Clears everything.
    pub fn clear(&self) {
        let mut inner = self.inner.write().unwrap();
        *inner = Inner::default();
    }
}

#[async_trait]
impl AtomicStore for InMemoryAtomicStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.write().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter += 1;
        Ok(*counter)
    }

    async fn decrement(&self, key: &str) -> Result<i64> {
        let mut inner = self.inner.write().unwrap();
        let counter = inner.counters.entry(key.to_string()).or_insert(0);
        *counter -= 1;
        Ok(*counter)
    }

    async fn counter(&self, key: &str) -> Result<i64> {
        let inner = self.inner.read().unwrap();
        Ok(inner.counters.get(key).copied().unwrap_or(0))
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string()))
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        Ok(inner
            .sets
            .get_mut(key)
            .is_some_and(|set| set.remove(member)))
    }

    async fn set_contains(&self, key: &str, member: &str) -> Result<bool> {
        let inner = self.inner.read().unwrap();
        Ok(inner.sets.get(key).is_some_and(|set| set.contains(member)))
    }

    async fn sorted_add(&self, key: &str, member: &str, score: i64) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let sorted = inner.sorted.entry(key.to_string()).or_default();
        if sorted.scores.contains_key(member) {
            return Ok(false);
        }
        sorted.scores.insert(member.to_string(), score);
        sorted.by_score.insert((score, member.to_string()));
        Ok(true)
    }

    async fn sorted_range(&self, key: &str, limit: usize) -> Result<Vec<(String, i64)>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .sorted
            .get(key)
            .map(|sorted| {
                sorted
                    .by_score
                    .iter()
                    .take(limit)
                    .map(|(score, member)| (member.clone(), *score))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn sorted_remove(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.write().unwrap();
        let Some(sorted) = inner.sorted.get_mut(key) else {
            return Ok(false);
        };
        match sorted.scores.remove(member) {
            Some(score) => {
                sorted.by_score.remove(&(score, member.to_string()));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn sorted_len(&self, key: &str) -> Result<usize> {
        let inner = self.inner.read().unwrap();
        Ok(inner.sorted.get(key).map_or(0, |s| s.scores.len()))
    }

    async fn sorted_rank(&self, key: &str, member: &str) -> Result<Option<usize>> {
        let inner = self.inner.read().unwrap();
        let Some(sorted) = inner.sorted.get(key) else {
            return Ok(None);
        };
        let Some(score) = sorted.scores.get(member) else {
            return Ok(None);
        };
        Ok(sorted
            .by_score
            .iter()
            .position(|(s, m)| s == score && m == member))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.write().unwrap();
        match inner.values.get(key) {
            Some((_, Some(expires_at))) if *expires_at <= Instant::now() => {
                inner.values.remove(key);
                tracing::trace!(key, "expired value dropped");
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        inner
            .values
            .insert(key.to_string(), (value.to_string(), expires_at));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.counters.remove(key);
        inner.sets.remove(key);
        inner.sorted.remove(key);
        inner.values.remove(key);
        Ok(())
    }
}

/// Parses a UUID-shaped sorted-set/set member back into a typed id.
pub fn parse_member<T: std::str::FromStr>(member: &str) -> Result<T> {
    member
        .parse()
        .map_err(|_| StoreError::Backend(format!("corrupt store member: {member}")))
}
