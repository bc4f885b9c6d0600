//! Lock acquisition errors.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by [`crate::LockCoordinator`].
///
/// A timeout is an infrastructure-level, transient condition — never a
/// business error. It means the critical section did not run at all.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock could not be obtained within the wait timeout.
    #[error("timed out acquiring lock '{key}' after {waited:?}")]
    Timeout { key: String, waited: Duration },
}
