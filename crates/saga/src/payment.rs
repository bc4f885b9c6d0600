//! Balance-backed payments.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use common::{Money, OrderId, UserId};

use crate::error::{Result, SagaError};
use crate::events::DomainEvent;
use crate::order::{OrderStatus, OrderStore};
use crate::outbox::EventPublisher;

/// Holds user balances and settles charges against them.
#[async_trait]
pub trait BalanceLedger: Send + Sync {
    /// Deducts `amount`, failing with `InsufficientBalance` if the user
    /// cannot cover it.
    async fn debit(&self, user_id: UserId, amount: Money) -> Result<()>;
    async fn credit(&self, user_id: UserId, amount: Money) -> Result<()>;
    async fn balance(&self, user_id: UserId) -> Result<Money>;
}

/// In-memory [`BalanceLedger`]. Missing users have a zero balance.
#[derive(Clone, Default)]
pub struct InMemoryBalanceLedger {
    balances: Arc<RwLock<HashMap<UserId, Money>>>,
}

impl InMemoryBalanceLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BalanceLedger for InMemoryBalanceLedger {
    async fn debit(&self, user_id: UserId, amount: Money) -> Result<()> {
        let mut balances = self.balances.write().unwrap();
        let available = balances.get(&user_id).copied().unwrap_or(Money::zero());
        match available.checked_sub(amount) {
            Some(remaining) => {
                balances.insert(user_id, remaining);
                Ok(())
            }
            None => Err(SagaError::InsufficientBalance {
                user_id,
                required: amount,
                available,
            }),
        }
    }

    async fn credit(&self, user_id: UserId, amount: Money) -> Result<()> {
        let mut balances = self.balances.write().unwrap();
        let entry = balances.entry(user_id).or_insert(Money::zero());
        *entry += amount;
        Ok(())
    }

    async fn balance(&self, user_id: UserId) -> Result<Money> {
        Ok(self
            .balances
            .read()
            .unwrap()
            .get(&user_id)
            .copied()
            .unwrap_or(Money::zero()))
    }
}

/// Turns a user's "pay now" action into a `PaymentCreated` event.
pub struct PaymentService {
    orders: Arc<dyn OrderStore>,
    publisher: EventPublisher,
}

impl PaymentService {
    pub fn new(orders: Arc<dyn OrderStore>, publisher: EventPublisher) -> Self {
        Self { orders, publisher }
    }

    /// Requests payment for an order awaiting it. The actual debit happens
    /// asynchronously in the payment handler.
    #[tracing::instrument(skip(self), fields(%order_id))]
    pub async fn request_payment(&self, order_id: OrderId) -> Result<()> {
        let order = self
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))?;
        if order.status != OrderStatus::AwaitingPayment {
            return Err(SagaError::InvalidTransition {
                order_id,
                detail: format!("{} order cannot request payment", order.status),
            });
        }

        self.publisher
            .publish(&DomainEvent::PaymentCreated {
                order_id,
                user_id: order.user_id,
                amount: order.total,
            })
            .await?;
        tracing::info!(amount = %order.total, "payment requested");
        Ok(())
    }
}
