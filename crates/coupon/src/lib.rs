//! First-come-first-served coupon issuance.
//!
//! Admission is decided synchronously against the shared [`AtomicStore`]
//! counter (at most `total_quantity` requests ever pass the gate), while the
//! durable coupon row and per-user grants are committed asynchronously by the
//! [`CouponIssuanceScheduler`] draining the waiting queue in admission order.
//!
//! [`AtomicStore`]: store::AtomicStore

pub mod admission;
pub mod coupon;
pub mod error;
pub mod grant;
pub mod memory;
pub mod postgres;
pub mod scheduler;
pub mod service;
pub mod store_api;

pub use admission::{IssueStatus, ReservationCounter};
pub use coupon::{Coupon, CouponStatus, DiscountRule};
pub use error::{CouponError, Result};
pub use grant::{GrantStatus, UserCouponGrant};
pub use memory::{InMemoryCouponStore, InMemoryGrantStore};
pub use postgres::{PostgresCouponStore, PostgresGrantStore};
pub use scheduler::{CouponIssuanceScheduler, SchedulerConfig};
pub use service::CouponIssueService;
pub use store_api::{CouponStore, GrantStore};
