//! # Background Consumer
//!
//! Owns the subscription queue of this service.
//!
//! ## Lifecycle
//!
//! ```text
//! NotStarted → Connecting → Declaring → Consuming → Stopped
//!                  │            │
//!                  └────────────┴──→ Errored (setup failure, no restart)
//! ```
//!
//! ## Dispatch
//!
//! Deliveries are processed one at a time, so handlers for different
//! deliveries never run in parallel. The handlers of a delivery run in
//! registration order and every one of them is invoked even if an earlier one
//! failed. Whatever happens, the delivery is then acknowledged exactly once:
//! failed deliveries are logged and dropped, not redelivered.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bus_telemetry::{
    TracePropagator, DELIVERIES_RECEIVED, DELIVERIES_UNROUTABLE, HANDLER_FAILURES,
};
use futures::{FutureExt, StreamExt};
use shared_types::{HandlerError, HandlerRegistry, SubscriptionInfo};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::BrokerError;
use crate::ports::{
    BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind, QueueOptions,
};
use crate::{EXCHANGE_NAME, MESSAGING_SYSTEM};

/// Consumer lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerState {
    NotStarted,
    Connecting,
    Declaring,
    Consuming,
    Stopped,
    /// Setup failed; the consumer will not start.
    Errored(String),
}

impl ConsumerState {
    /// Whether the consumer has finished for good.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped | Self::Errored(_))
    }
}

/// What happened to one delivery. Every outcome is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Every resolved handler succeeded (possibly zero handlers).
    Handled { handlers: usize },
    /// No event type is registered for the routing key.
    Unroutable,
    /// Payload was not UTF-8 or did not decode into the event type.
    Undecodable,
    /// At least one handler failed.
    HandlerFailed { failed: usize, handlers: usize },
}

/// Receives deliveries from the subscription queue and dispatches them.
pub struct BackgroundConsumer {
    connection: Arc<dyn BrokerConnection>,
    subscriptions: Arc<SubscriptionInfo>,
    handlers: Arc<HandlerRegistry>,
    queue_name: String,
    exchange: String,
    propagator: TracePropagator,
    state: watch::Sender<ConsumerState>,
}

impl BackgroundConsumer {
    #[must_use]
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        subscriptions: Arc<SubscriptionInfo>,
        handlers: Arc<HandlerRegistry>,
        queue_name: impl Into<String>,
    ) -> Self {
        let (state, _) = watch::channel(ConsumerState::NotStarted);
        Self {
            connection,
            subscriptions,
            handlers,
            queue_name: queue_name.into(),
            exchange: EXCHANGE_NAME.to_string(),
            propagator: TracePropagator::new(),
            state,
        }
    }

    /// Watch the lifecycle state.
    #[must_use]
    pub fn state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    #[must_use]
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    fn set_state(&self, state: ConsumerState) {
        debug!(queue = %self.queue_name, state = ?state, "Consumer state changed");
        self.state.send_replace(state);
    }

    /// Set up the queue and consume until `cancel` fires or the delivery
    /// stream ends. Setup failures are logged and end in `Errored`.
    pub async fn run(self, cancel: CancellationToken) {
        self.set_state(ConsumerState::Connecting);

        if !self.connection.is_open() {
            error!(queue = %self.queue_name, "Broker connection is not open; consumer not started");
            self.set_state(ConsumerState::Errored(
                "connection is not open".to_string(),
            ));
            return;
        }

        let (channel, mut deliveries) = match self.setup().await {
            Ok(ready) => ready,
            Err(e) => {
                error!(queue = %self.queue_name, error = %e, "Consumer setup failed; consumer not started");
                self.set_state(ConsumerState::Errored(e.to_string()));
                return;
            }
        };

        self.set_state(ConsumerState::Consuming);
        info!(
            queue = %self.queue_name,
            events = ?self.subscriptions.event_names().collect::<Vec<_>>(),
            "Consumer started"
        );

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => self.process(delivery).await,
                Some(Err(e)) if e.is_connectivity() => {
                    error!(queue = %self.queue_name, error = %e, "Delivery stream lost its connection");
                    break;
                }
                Some(Err(e)) => {
                    warn!(queue = %self.queue_name, error = %e, "Delivery stream error");
                }
                None => {
                    warn!(queue = %self.queue_name, "Delivery stream ended");
                    break;
                }
            }
        }

        drop(deliveries);
        if let Err(e) = channel.close().await {
            debug!(queue = %self.queue_name, error = %e, "Closing consumer channel failed");
        }
        self.set_state(ConsumerState::Stopped);
        info!(queue = %self.queue_name, "Consumer stopped");
    }

    async fn setup(&self) -> Result<(Box<dyn BrokerChannel>, DeliveryStream), BrokerError> {
        let channel = self.connection.create_channel().await?;

        let queue = self.queue_name.clone();
        channel.on_fault(Box::new(move |fault| {
            warn!(queue = %queue, error = %fault, "Consumer channel fault");
        }));

        self.set_state(ConsumerState::Declaring);
        match self.declare_and_consume(channel.as_ref()).await {
            Ok(deliveries) => Ok((channel, deliveries)),
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!(error = %close_error, "Closing consumer channel failed");
                }
                Err(e)
            }
        }
    }

    async fn declare_and_consume(
        &self,
        channel: &dyn BrokerChannel,
    ) -> Result<DeliveryStream, BrokerError> {
        channel
            .declare_exchange(&self.exchange, ExchangeKind::Direct)
            .await?;
        channel
            .declare_queue(&self.queue_name, QueueOptions::durable())
            .await?;

        let deliveries = channel.consume(&self.queue_name, &self.queue_name).await?;

        for event_name in self.subscriptions.event_names() {
            channel
                .bind_queue(&self.queue_name, &self.exchange, event_name)
                .await?;
        }

        Ok(deliveries)
    }

    async fn process(&self, delivery: Delivery) {
        let delivery_tag = delivery.delivery_tag;
        let outcome = self.handle_delivery(&delivery).await;
        debug!(delivery_tag, routing_key = %delivery.routing_key, outcome = ?outcome, "Delivery processed");

        if let Err(e) = delivery.ack().await {
            error!(delivery_tag, error = %e, "Failed to acknowledge delivery");
        }
    }

    /// Handle one delivery inside a consumer span parented on the publisher's
    /// trace context. Never fails; the outcome says what happened.
    pub async fn handle_delivery(&self, delivery: &Delivery) -> DeliveryOutcome {
        let routing_key = delivery.routing_key.as_str();
        let span_name = format!("{routing_key} receive");
        let span = info_span!(
            "receive",
            otel.name = span_name.as_str(),
            otel.kind = "consumer",
            otel.status_code = Empty,
            exception.message = Empty,
            messaging.system = MESSAGING_SYSTEM,
            messaging.destination_kind = "queue",
            messaging.operation = "receive",
            messaging.destination.name = self.queue_name.as_str(),
            messaging.rabbitmq.routing_key = routing_key,
            messaging.message.delivery_tag = delivery.delivery_tag,
            message = Empty,
        );
        span.set_parent(self.propagator.extract(delivery.headers.as_ref()));

        self.dispatch(delivery, &span).instrument(span.clone()).await
    }

    async fn dispatch(&self, delivery: &Delivery, span: &Span) -> DeliveryOutcome {
        let routing_key = delivery.routing_key.as_str();

        let message = match std::str::from_utf8(&delivery.payload) {
            Ok(message) => message,
            Err(e) => {
                DELIVERIES_RECEIVED.with_label_values(&["undecodable"]).inc();
                mark_failed(span, &e);
                warn!(routing_key, error = %e, "Delivery payload is not UTF-8; dropping");
                return DeliveryOutcome::Undecodable;
            }
        };
        span.record("message", message);

        let Some(descriptor) = self.subscriptions.lookup(routing_key) else {
            DELIVERIES_RECEIVED.with_label_values(&["unregistered"]).inc();
            DELIVERIES_UNROUTABLE.inc();
            warn!(routing_key, "No event type registered for routing key; dropping delivery");
            return DeliveryOutcome::Unroutable;
        };
        let event_name = descriptor.name();
        DELIVERIES_RECEIVED.with_label_values(&[event_name]).inc();

        let event = match descriptor.decode(self.subscriptions.serializer(), &delivery.payload) {
            Ok(event) => event,
            Err(e) => {
                mark_failed(span, &e);
                warn!(event = event_name, error = %e, "Delivery payload did not decode; dropping");
                return DeliveryOutcome::Undecodable;
            }
        };

        let handlers = self.handlers.resolve(descriptor.type_id());
        if handlers.is_empty() {
            debug!(event = event_name, "No handlers registered for event");
        }

        let mut failed = 0;
        for handler in &handlers {
            let result = AssertUnwindSafe(handler.handle_erased(&*event))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panic_message(panic)));

            if let Err(e) = result {
                failed += 1;
                HANDLER_FAILURES.with_label_values(&[event_name]).inc();
                mark_failed(span, &e);
                error!(
                    event = event_name,
                    handler = handler.handler_name(),
                    error = %e,
                    "Integration event handler failed"
                );
            }
        }

        if failed == 0 {
            DeliveryOutcome::Handled {
                handlers: handlers.len(),
            }
        } else {
            DeliveryOutcome::HandlerFailed {
                failed,
                handlers: handlers.len(),
            }
        }
    }
}

fn mark_failed<E: std::fmt::Display + ?Sized>(span: &Span, error: &E) {
    span.record("otel.status_code", "ERROR");
    span.record("exception.message", error.to_string().as_str());
}

fn panic_message(panic: Box<dyn Any + Send>) -> HandlerError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "handler panicked".to_string());
    HandlerError::from(format!("handler panicked: {message}"))
}
