//! Shared storage error taxonomy.

use common::Version;
use concurrency::Conflict;
use thiserror::Error;

/// Errors raised by repositories and the shared atomic store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Optimistic-concurrency conflict: the row changed since it was read.
    #[error("version conflict on {entity} {id}: expected {expected}, found {actual}")]
    VersionConflict {
        entity: &'static str,
        id: String,
        expected: Version,
        actual: Version,
    },

    /// The requested row does not exist.
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// A uniqueness constraint was violated (e.g. one grant per
    /// user/coupon pair, or a duplicate outbox event id).
    #[error("unique constraint violated on {entity}: {detail}")]
    UniqueViolation {
        entity: &'static str,
        detail: String,
    },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A serialization/deserialization error occurred.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The shared atomic store backend failed or returned corrupt data.
    #[error("shared store backend error: {0}")]
    Backend(String),
}

impl Conflict for StoreError {
    fn is_version_conflict(&self) -> bool {
        matches!(self, StoreError::VersionConflict { .. })
    }
}

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_version_conflict_is_retryable() {
        let conflict = StoreError::VersionConflict {
            entity: "coupon",
            id: "x".into(),
            expected: Version::new(1),
            actual: Version::new(2),
        };
        assert!(conflict.is_version_conflict());

        let missing = StoreError::NotFound {
            entity: "coupon",
            id: "x".into(),
        };
        assert!(!missing.is_version_conflict());
    }
}
