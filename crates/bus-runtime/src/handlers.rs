//! # Event Handlers
//!
//! Deliveries may arrive more than once, so handlers go through the
//! [`OrderLedger`], which ignores orders it has already seen.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shared_types::{HandlerError, IntegrationEvent, IntegrationEventHandler};
use tracing::{debug, info};

use crate::events::{OrderCreated, OrderPaid};

/// Orders this service has processed.
#[derive(Debug, Default)]
pub struct OrderLedger {
    created: Mutex<BTreeSet<u64>>,
    paid: Mutex<BTreeSet<u64>>,
}

impl OrderLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a created order. Returns `false` for a duplicate.
    pub fn record_created(&self, order_id: u64) -> bool {
        self.created.lock().insert(order_id)
    }

    /// Record a paid order. Returns `false` for a duplicate.
    pub fn record_paid(&self, order_id: u64) -> bool {
        self.paid.lock().insert(order_id)
    }

    #[must_use]
    pub fn created(&self) -> Vec<u64> {
        self.created.lock().iter().copied().collect()
    }

    #[must_use]
    pub fn paid(&self) -> Vec<u64> {
        self.paid.lock().iter().copied().collect()
    }
}

pub struct OrderCreatedHandler {
    ledger: Arc<OrderLedger>,
}

impl OrderCreatedHandler {
    #[must_use]
    pub fn new(ledger: Arc<OrderLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for OrderCreatedHandler {
    async fn handle(&self, event: &OrderCreated) -> Result<(), HandlerError> {
        if !self.ledger.record_created(event.order_id) {
            debug!(order_id = event.order_id, event_id = %event.id(), "Duplicate OrderCreated ignored");
            return Ok(());
        }
        info!(
            order_id = event.order_id,
            buyer = %event.buyer,
            event_id = %event.id(),
            "Order created"
        );
        Ok(())
    }
}

pub struct OrderPaidHandler {
    ledger: Arc<OrderLedger>,
}

impl OrderPaidHandler {
    #[must_use]
    pub fn new(ledger: Arc<OrderLedger>) -> Self {
        Self { ledger }
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderPaid> for OrderPaidHandler {
    async fn handle(&self, event: &OrderPaid) -> Result<(), HandlerError> {
        if !self.ledger.created().contains(&event.order_id) {
            return Err(format!("payment for unknown order {}", event.order_id).into());
        }
        if self.ledger.record_paid(event.order_id) {
            info!(order_id = event.order_id, amount_cents = event.amount_cents, "Order paid");
        }
        Ok(())
    }
}
