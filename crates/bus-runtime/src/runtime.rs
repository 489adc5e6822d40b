//! # Bus Runtime
//!
//! Wires the event bus with this service's subscriptions and drives its
//! lifecycle.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use shared_bus::{BrokerConnection, ConsumerState, EventBus, EventBusConfig, EventBusError};
use tracing::{error, info};

use crate::events::{OrderCreated, OrderPaid};
use crate::handlers::{OrderCreatedHandler, OrderLedger, OrderPaidHandler};

/// How long `start` waits for the consumer to leave its setup states.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(30);

/// Integration bus host for the ordering service.
pub struct BusRuntime {
    bus: EventBus,
    ledger: Arc<OrderLedger>,
}

impl BusRuntime {
    /// Build the bus and register every subscription of this service.
    pub fn new(connection: Arc<dyn BrokerConnection>, config: EventBusConfig) -> Self {
        info!(client = %config.subscription_client_name, "Creating integration bus runtime");

        let ledger = Arc::new(OrderLedger::new());
        let created = Arc::clone(&ledger);
        let paid = Arc::clone(&ledger);

        let bus = EventBus::builder(connection, config)
            .add_subscription::<OrderCreated, _, _>(move || {
                OrderCreatedHandler::new(Arc::clone(&created))
            })
            .add_subscription::<OrderPaid, _, _>(move || OrderPaidHandler::new(Arc::clone(&paid)))
            .build();

        Self { bus, ledger }
    }

    /// Start the consumer and wait until it is consuming.
    ///
    /// A consumer that fails to set up does not fail the host: the error is
    /// logged and the returned state is `Errored`.
    pub async fn start(&self) -> Result<ConsumerState> {
        self.bus.start().context("starting event bus")?;

        let state = tokio::time::timeout(
            STARTUP_TIMEOUT,
            self.bus
                .wait_for_state(|s| *s == ConsumerState::Consuming || s.is_terminal()),
        )
        .await
        .context("consumer did not finish setup in time")?;

        match &state {
            ConsumerState::Consuming => {
                info!(queue = %self.bus.queue_name(), "Integration bus is consuming");
            }
            ConsumerState::Errored(reason) => {
                error!(queue = %self.bus.queue_name(), %reason, "Consumer failed to start; publishing only");
            }
            _ => {}
        }
        Ok(state)
    }

    /// Publish one `OrderCreated` for smoke testing a deployment.
    pub async fn publish_demo(&self, order_id: u64) -> Result<(), EventBusError> {
        let event = OrderCreated::new(order_id, "demo");
        info!(order_id, "Publishing demo OrderCreated");
        self.bus.publish(&event).await
    }

    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    #[must_use]
    pub fn ledger(&self) -> Arc<OrderLedger> {
        Arc::clone(&self.ledger)
    }

    /// Stop consuming and abort in-flight publishes.
    pub async fn shutdown(&self) -> Result<(), EventBusError> {
        info!("Initiating graceful shutdown...");
        self.bus.shutdown().await?;
        info!("Shutdown complete");
        Ok(())
    }
}
