//! Optimistic-concurrency version stamp.

use serde::{Deserialize, Serialize};

/// Version number carried by mutable aggregates for optimistic concurrency
/// control.
///
/// A row starts at version 0 when first persisted; every successful save
/// increments it by 1. A save whose expected version does not match the
/// stored version is a conflict.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Version(i64);

impl Version {
    /// Creates a version from a raw value.
    pub fn new(value: i64) -> Self {
        Self(value)
    }

    /// Returns the initial version for a newly created aggregate.
    pub fn initial() -> Self {
        Self(0)
    }

    /// Returns the next version.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }

    /// Returns the raw value.
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl std::fmt::Display for Version {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Version {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<Version> for i64 {
    fn from(version: Version) -> Self {
        version.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_increments() {
        assert_eq!(Version::initial().next(), Version::new(1));
        assert_eq!(Version::new(41).next(), Version::new(42));
    }

    #[test]
    fn ordering() {
        assert!(Version::initial() < Version::new(1));
    }
}
