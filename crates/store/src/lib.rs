//! Storage kernel for the commerce concurrency layer.
//!
//! Provides the shared error taxonomy for every repository in the workspace
//! and the [`AtomicStore`] port — the externally shared, atomically operable
//! store (Redis in a multi-instance deployment) that backs the coupon
//! admission pipeline. Domain crates define their own repository traits and
//! implementations on top of [`StoreError`].

pub mod atomic;
pub mod error;
pub mod memory;

pub use atomic::AtomicStore;
pub use error::{Result, StoreError};
pub use memory::InMemoryAtomicStore;
