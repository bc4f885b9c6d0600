//! Shared value types for the commerce concurrency layer.
//!
//! This crate provides the typed identifiers, `Money`, and the optimistic
//! concurrency `Version` stamp shared by every other crate in the workspace.

pub mod ids;
pub mod money;
pub mod version;

pub use ids::{CouponId, EventId, GrantId, OrderId, ProductId, ReservationId, UserId};
pub use money::Money;
pub use version::Version;
