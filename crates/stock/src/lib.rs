//! Product stock lifecycle.
//!
//! Stock moves through a two-phase commit: `reserve` earmarks quantity
//! without deducting it, then `confirm` deducts it for good or
//! `release`/`expire` return it. All mutations run under a per-product lock
//! through the [`StockLedger`], with version-stamped saves underneath as a
//! second line of defence.

pub mod error;
pub mod ledger;
pub mod memory;
pub mod postgres;
pub mod product_stock;
pub mod reservation;
pub mod store_api;
pub mod sweeper;

pub use error::{Result, StockError};
pub use ledger::{LedgerConfig, StockLedger};
pub use memory::{InMemoryProductStockStore, InMemoryStockReservationStore};
pub use postgres::{PostgresProductStockStore, PostgresStockReservationStore};
pub use product_stock::ProductStock;
pub use reservation::{ReservationStatus, StockReservation};
pub use store_api::{ProductStockStore, StockReservationStore};
pub use sweeper::ExpirySweeper;
