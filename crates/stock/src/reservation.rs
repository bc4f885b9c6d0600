//! Stock reservations.

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::error::{Result, StockError};

/// Lifecycle state of a reservation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationStatus {
    /// Quantity is earmarked; payment pending.
    Reserved,
    /// Quantity was deducted for good.
    Confirmed,
    /// Quantity was returned (cancellation, payment failure, or expiry).
    Released,
}

/// One order line's hold on product stock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockReservation {
    pub id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub status: ReservationStatus,
    pub reserved_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

impl StockReservation {
    /// Creates a RESERVED reservation expiring at `expires_at`.
    pub fn new(
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
        reserved_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: ReservationId::new(),
            order_id,
            product_id,
            quantity,
            status: ReservationStatus::Reserved,
            reserved_at,
            expires_at,
            confirmed_at: None,
        }
    }

    /// Confirms the reservation. Strict: anything but RESERVED is an
    /// `InvalidState` error, so a late confirm after expiry cannot deduct
    /// stock twice.
    pub fn confirm(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.status != ReservationStatus::Reserved {
            return Err(StockError::InvalidState {
                reservation_id: self.id,
                required: ReservationStatus::Reserved,
                actual: self.status,
            });
        }
        self.status = ReservationStatus::Confirmed;
        self.confirmed_at = Some(now);
        Ok(())
    }

    /// Releases the reservation. Idempotent: returns false (and changes
    /// nothing) if the reservation is already terminal, tolerating event
    /// redelivery.
    pub fn release(&mut self) -> bool {
        if self.status != ReservationStatus::Reserved {
            return false;
        }
        self.status = ReservationStatus::Released;
        true
    }

    /// True if still RESERVED past its deadline at `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == ReservationStatus::Reserved && self.expires_at <= now
    }
}
