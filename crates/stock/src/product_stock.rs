//! Per-product stock row.

use common::{ProductId, Version};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StockError};

/// Stock levels for one product.
///
/// `current` is the on-hand quantity; `reserved` is the part of it earmarked
/// by open reservations. Available quantity is `current - reserved`, and the
/// invariant `reserved <= current` holds across every mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductStock {
    pub product_id: ProductId,
    pub current: u32,
    pub reserved: u32,
    pub version: Version,
}

impl ProductStock {
    /// Creates a stock row with `current` on hand and nothing reserved.
    pub fn new(product_id: ProductId, current: u32) -> Self {
        Self {
            product_id,
            current,
            reserved: 0,
            version: Version::initial(),
        }
    }

    /// Unreserved quantity.
    pub fn available(&self) -> u32 {
        self.current.saturating_sub(self.reserved)
    }

    /// Earmarks `quantity` without deducting it.
    pub fn reserve(&mut self, quantity: u32) -> Result<()> {
        if self.available() < quantity {
            return Err(StockError::OutOfStock {
                product_id: self.product_id,
                requested: quantity,
                available: self.available(),
            });
        }
        self.reserved += quantity;
        Ok(())
    }

    /// Deducts a previously reserved `quantity` for good.
    pub fn confirm(&mut self, quantity: u32) -> Result<()> {
        if self.reserved < quantity || self.current < quantity {
            return Err(StockError::Inconsistent {
                product_id: self.product_id,
                detail: format!(
                    "confirm of {quantity} against current={}, reserved={}",
                    self.current, self.reserved
                ),
            });
        }
        self.current -= quantity;
        self.reserved -= quantity;
        Ok(())
    }

    /// Returns a previously reserved `quantity` to the available pool.
    pub fn release(&mut self, quantity: u32) -> Result<()> {
        if self.reserved < quantity {
            return Err(StockError::Inconsistent {
                product_id: self.product_id,
                detail: format!("release of {quantity} against reserved={}", self.reserved),
            });
        }
        self.reserved -= quantity;
        Ok(())
    }
}
