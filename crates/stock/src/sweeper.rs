//! Reclaims reservations whose payment never arrived.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result;
use crate::ledger::StockLedger;
use crate::store_api::StockReservationStore;

/// Periodically expires RESERVED reservations past their deadline.
pub struct ExpirySweeper {
    ledger: StockLedger,
    reservations: Arc<dyn StockReservationStore>,
    interval: Duration,
}

impl ExpirySweeper {
    pub fn new(
        ledger: StockLedger,
        reservations: Arc<dyn StockReservationStore>,
        interval: Duration,
    ) -> Self {
        Self {
            ledger,
            reservations,
            interval,
        }
    }

    /// Sweeps at the configured interval until `shutdown` flips to true or
    /// its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sweep_once().await {
                        tracing::error!(error = %e, "expiry sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("expiry sweeper stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One sweep. Returns how many reservations were reclaimed; a failure
    /// on one reservation does not stop the rest.
    #[tracing::instrument(skip(self))]
    pub async fn sweep_once(&self) -> Result<usize> {
        let expired = self.reservations.find_expired_before(Utc::now()).await?;
        let mut reclaimed = 0;

        for reservation in expired {
            match self.ledger.expire(reservation.id).await {
                Ok(true) => reclaimed += 1,
                // Settled between the query and the expire call.
                Ok(false) => {}
                Err(e) => {
                    tracing::warn!(
                        reservation_id = %reservation.id,
                        error = %e,
                        "failed to expire reservation"
                    );
                }
            }
        }

        if reclaimed > 0 {
            metrics::counter!("stock_reservations_swept_total").increment(reclaimed as u64);
            tracing::info!(reclaimed, "expired reservations reclaimed");
        }
        Ok(reclaimed)
    }
}
