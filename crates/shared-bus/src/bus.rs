//! # Event Bus Facade
//!
//! Composes the publisher and the background consumer behind one
//! lifecycle-managed service.
//!
//! ```rust,ignore
//! let bus = EventBus::builder(connection, EventBusConfig::from_env()?)
//!     .add_subscription::<OrderCreated, _, _>(move || OrderCreatedHandler::new(ledger.clone()))
//!     .build();
//!
//! bus.start()?;                       // consumer runs in the background
//! bus.publish(&OrderCreated::new(123)).await?;
//! bus.shutdown().await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use shared_types::{
    EventSerializer, HandlerRegistry, IntegrationEvent, IntegrationEventHandler,
    SerializerOptions, SubscriptionInfo,
};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use crate::config::EventBusConfig;
use crate::consumer::{BackgroundConsumer, ConsumerState};
use crate::error::EventBusError;
use crate::ports::BrokerConnection;
use crate::publisher::ResilientPublisher;

/// Collects subscriptions and serializer settings, then builds the bus.
pub struct EventBusBuilder {
    connection: Arc<dyn BrokerConnection>,
    config: EventBusConfig,
    subscriptions: SubscriptionInfo,
    handlers: HandlerRegistry,
}

impl EventBusBuilder {
    #[must_use]
    pub fn new(connection: Arc<dyn BrokerConnection>, config: EventBusConfig) -> Self {
        let serializer = EventSerializer::new(config.serializer);
        Self {
            connection,
            config,
            subscriptions: SubscriptionInfo::new(serializer),
            handlers: HandlerRegistry::new(),
        }
    }

    /// Subscribe to `E`, handled by instances built by `factory`.
    ///
    /// Calling this again for the same event adds another handler.
    #[must_use]
    pub fn add_subscription<E, H, F>(mut self, factory: F) -> Self
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        self.subscriptions.register::<E>();
        self.handlers.register::<E, H, F>(factory);
        self
    }

    /// Adjust the serializer options used for both publish and consume.
    #[must_use]
    pub fn configure_serializer(mut self, configure: impl FnOnce(&mut SerializerOptions)) -> Self {
        let mut options = *self.subscriptions.serializer().options();
        configure(&mut options);
        self.subscriptions
            .set_serializer(EventSerializer::new(options));
        self
    }

    #[must_use]
    pub fn build(self) -> EventBus {
        let publisher = ResilientPublisher::new(
            self.connection.clone(),
            self.subscriptions.serializer().clone(),
            self.config.retry_policy(),
        );
        let consumer = BackgroundConsumer::new(
            self.connection,
            Arc::new(self.subscriptions),
            Arc::new(self.handlers),
            self.config.subscription_client_name.clone(),
        );
        let state = consumer.state();

        EventBus {
            publisher,
            consumer: Mutex::new(Some(consumer)),
            state,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            shutdown_grace: self.config.shutdown_grace,
            queue_name: self.config.subscription_client_name,
        }
    }
}

/// The integration event bus.
///
/// Publishing may be called concurrently from any number of tasks. The
/// consumer runs as one background task between `start` and `shutdown`.
pub struct EventBus {
    publisher: ResilientPublisher,
    /// Taken by `start`.
    consumer: Mutex<Option<BackgroundConsumer>>,
    state: watch::Receiver<ConsumerState>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    shutdown_grace: Duration,
    queue_name: String,
}

impl EventBus {
    #[must_use]
    pub fn builder(connection: Arc<dyn BrokerConnection>, config: EventBusConfig) -> EventBusBuilder {
        EventBusBuilder::new(connection, config)
    }

    /// Spawn the consumer in the background and return immediately.
    ///
    /// Fails with `AlreadyStarted` on a second call and with `ShutDown` once
    /// `shutdown` has run. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), EventBusError> {
        if self.cancel.is_cancelled() {
            return Err(EventBusError::ShutDown);
        }
        let consumer = self
            .consumer
            .lock()
            .take()
            .ok_or(EventBusError::AlreadyStarted)?;

        info!(queue = %self.queue_name, "Starting event bus consumer");
        self.tracker.spawn(consumer.run(self.cancel.child_token()));
        Ok(())
    }

    /// Publish `event`. Aborted by `shutdown`.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError> {
        self.publisher
            .publish_with_cancellation(event, &self.cancel)
            .await
    }

    /// Publish `event`; either `cancel` or `shutdown` aborts it.
    pub async fn publish_with_cancellation<E: IntegrationEvent>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<(), EventBusError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(EventBusError::Cancelled { event: E::event_name() }),
            result = self.publisher.publish_with_cancellation(event, cancel) => result,
        }
    }

    /// Current consumer state.
    #[must_use]
    pub fn consumer_state(&self) -> ConsumerState {
        self.state.borrow().clone()
    }

    /// Wait until the consumer state satisfies `predicate`.
    ///
    /// Returns the final state if the consumer goes away first.
    pub async fn wait_for_state(
        &self,
        predicate: impl FnMut(&ConsumerState) -> bool,
    ) -> ConsumerState {
        let mut state = self.state.clone();
        let reached = state.wait_for(predicate).await.map(|s| s.clone());
        reached.unwrap_or_else(|_| self.consumer_state())
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Stop the consumer and abort in-flight publishes.
    ///
    /// The consumer finishes the delivery it is handling, closes its channel
    /// and stops. Fails if that takes longer than the configured grace period.
    pub async fn shutdown(&self) -> Result<(), EventBusError> {
        info!(queue = %self.queue_name, "Shutting down event bus");
        self.cancel.cancel();
        self.tracker.close();
        // Never started: nothing to wait for.
        self.consumer.lock().take();

        if tokio::time::timeout(self.shutdown_grace, self.tracker.wait())
            .await
            .is_err()
        {
            warn!(
                queue = %self.queue_name,
                grace_ms = self.shutdown_grace.as_millis() as u64,
                "Consumer did not stop within the grace period"
            );
            return Err(EventBusError::ShutdownTimeout(self.shutdown_grace));
        }

        info!(queue = %self.queue_name, "Event bus stopped");
        Ok(())
    }
}

impl Drop for EventBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
