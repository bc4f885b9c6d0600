//! Outbox polling and event delivery.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::error::Result as SagaResult;
use crate::events::DomainEvent;
use crate::outbox::OutboxStore;

/// Reacts to saga events. Handlers must tolerate redelivery: the same
/// event may arrive more than once, and an `Err` leaves the record pending
/// for another pass. Business failures are not errors here; a handler
/// settles them itself (usually by publishing a failure event) and
/// returns `Ok`.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name for logs and dead-letter messages.
    fn name(&self) -> &'static str;

    async fn handle(&self, event: &DomainEvent) -> SagaResult<()>;
}

/// Tuning knobs for the outbox dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Delay between polls.
    pub interval: Duration,
    /// Upper bound on records delivered per pass.
    pub batch_size: usize,
    /// Delivery attempts before a record is parked as a dead letter.
    pub max_retries: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            batch_size: 50,
            max_retries: 5,
        }
    }
}

/// Polls PENDING outbox records in creation order and feeds each one to
/// every registered handler.
///
/// A record is marked PUBLISHED only after all handlers returned `Ok`. A
/// handler error increments the record's retry counter and leaves it
/// PENDING, so the whole record is redelivered to all handlers next pass
/// (hence the idempotency requirement). Past `max_retries` attempts the
/// record becomes a dead letter.
pub struct OutboxDispatcher {
    outbox: Arc<dyn OutboxStore>,
    handlers: Vec<Arc<dyn EventHandler>>,
    config: DispatcherConfig,
}

impl OutboxDispatcher {
    pub fn new(
        outbox: Arc<dyn OutboxStore>,
        handlers: Vec<Arc<dyn EventHandler>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            outbox,
            handlers,
            config,
        }
    }

    /// Polls at the configured interval until `shutdown` flips to true or
    /// its sender drops.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.drain().await {
                        tracing::error!(error = %e, "outbox poll failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        tracing::info!("outbox dispatcher stopping");
                        return;
                    }
                }
            }
        }
    }

    /// One delivery pass. Returns the number of records published, so a
    /// test can pump the saga to quiescence by draining until zero.
    #[tracing::instrument(skip(self))]
    pub async fn drain(&self) -> SagaResult<usize> {
        let records = self.outbox.find_pending(self.config.batch_size).await?;
        let mut published = 0;

        for record in records {
            let event = match record.decode() {
                Ok(event) => event,
                Err(e) => {
                    // An undecodable payload can never succeed; park it now.
                    tracing::error!(event_id = %record.event_id, error = %e, "undecodable outbox payload");
                    self.outbox
                        .mark_failed(record.event_id, &e.to_string())
                        .await?;
                    continue;
                }
            };

            match self.deliver(&event).await {
                Ok(()) => {
                    self.outbox.mark_published(record.event_id).await?;
                    metrics::counter!("outbox_published_total").increment(1);
                    published += 1;
                }
                Err((handler, e)) => {
                    let error = format!("{handler}: {e}");
                    let retries = self.outbox.record_failure(record.event_id, &error).await?;
                    if retries >= self.config.max_retries {
                        tracing::error!(
                            event_id = %record.event_id,
                            event_type = record.event_type,
                            retries,
                            %error,
                            "outbox record dead-lettered"
                        );
                        self.outbox.mark_failed(record.event_id, &error).await?;
                        metrics::counter!("outbox_dead_letters_total").increment(1);
                    } else {
                        tracing::warn!(
                            event_id = %record.event_id,
                            event_type = record.event_type,
                            retries,
                            %error,
                            "delivery failed, record stays pending"
                        );
                    }
                }
            }
        }

        Ok(published)
    }

    async fn deliver(
        &self,
        event: &DomainEvent,
    ) -> std::result::Result<(), (&'static str, crate::error::SagaError)> {
        for handler in &self.handlers {
            if let Err(e) = handler.handle(event).await {
                return Err((handler.name(), e));
            }
        }
        Ok(())
    }
}
