//! # Resilient Publisher
//!
//! Publishes integration events to the bus exchange.
//!
//! The event is serialized once, up front, so a serialization failure is
//! reported immediately and every attempt sends identical bytes. Each attempt
//! then runs in its own producer span:
//!
//! 1. open a channel on the shared connection
//! 2. declare the direct exchange
//! 3. inject the span's trace context and baggage into the headers
//! 4. publish a persistent message with routing key = event name
//! 5. close the channel
//!
//! Connectivity failures anywhere in 1-4 are retried with exponential
//! backoff. Publishing is at-least-once: a retried attempt may duplicate a
//! message whose first confirmation was lost.

use std::sync::Arc;

use bus_telemetry::{
    time_histogram, TracePropagator, EVENTS_PUBLISHED, PUBLISH_DURATION, PUBLISH_FAILURES,
    PUBLISH_RETRIES,
};
use shared_types::{EventSerializer, IntegrationEvent};
use tokio_util::sync::CancellationToken;
use tracing::field::Empty;
use tracing::{debug, info_span, warn, Instrument, Span};
use tracing_opentelemetry::OpenTelemetrySpanExt;

use crate::error::{BrokerError, EventBusError};
use crate::ports::{BrokerChannel, BrokerConnection, ExchangeKind, OutboundMessage};
use crate::retry::{RetryError, RetryPolicy};
use crate::{EXCHANGE_NAME, MESSAGING_SYSTEM};

/// Publishes events with retries. Safe to share between concurrent callers:
/// every attempt uses its own channel.
pub struct ResilientPublisher {
    connection: Arc<dyn BrokerConnection>,
    serializer: EventSerializer,
    propagator: TracePropagator,
    retry: RetryPolicy,
    exchange: String,
}

impl ResilientPublisher {
    #[must_use]
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        serializer: EventSerializer,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            connection,
            serializer,
            propagator: TracePropagator::new(),
            retry,
            exchange: EXCHANGE_NAME.to_string(),
        }
    }

    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Publish `event`, retrying connectivity failures.
    pub async fn publish<E: IntegrationEvent>(&self, event: &E) -> Result<(), EventBusError> {
        self.publish_with_cancellation(event, &CancellationToken::new())
            .await
    }

    /// Publish `event`; `cancel` aborts the in-flight attempt and any backoff.
    pub async fn publish_with_cancellation<E: IntegrationEvent>(
        &self,
        event: &E,
        cancel: &CancellationToken,
    ) -> Result<(), EventBusError> {
        let event_name = E::event_name();

        let payload = self.serializer.serialize(event).map_err(|source| {
            PUBLISH_FAILURES.with_label_values(&[event_name]).inc();
            warn!(event = event_name, event_id = %event.id(), error = %source, "Event serialization failed");
            EventBusError::Serialization {
                event: event_name,
                source,
            }
        })?;

        let _timer = time_histogram!(PUBLISH_DURATION);
        debug!(event = event_name, event_id = %event.id(), "Publishing integration event");

        let result = self
            .retry
            .run(
                cancel,
                |attempt| {
                    if attempt > 1 {
                        PUBLISH_RETRIES.with_label_values(&[event_name]).inc();
                    }
                    self.attempt(event_name, &payload, attempt)
                },
                BrokerError::is_connectivity,
            )
            .await;

        match result {
            Ok(()) => {
                EVENTS_PUBLISHED.with_label_values(&[event_name]).inc();
                debug!(event = event_name, event_id = %event.id(), "Integration event published");
                Ok(())
            }
            Err(RetryError::Failed { attempts, error }) => {
                PUBLISH_FAILURES.with_label_values(&[event_name]).inc();
                warn!(
                    event = event_name,
                    event_id = %event.id(),
                    attempts,
                    error = %error,
                    "Publishing integration event failed"
                );
                Err(EventBusError::Publish {
                    event: event_name,
                    attempts,
                    source: error,
                })
            }
            Err(RetryError::Cancelled { attempts }) => {
                debug!(event = event_name, attempts, "Publish cancelled");
                Err(EventBusError::Cancelled { event: event_name })
            }
        }
    }

    /// One publish attempt inside its own producer span.
    async fn attempt(
        &self,
        event_name: &'static str,
        payload: &[u8],
        attempt: u32,
    ) -> Result<(), BrokerError> {
        let span_name = format!("{event_name} Publish");
        let span = info_span!(
            "publish",
            otel.name = span_name.as_str(),
            otel.kind = "producer",
            otel.status_code = Empty,
            exception.message = Empty,
            messaging.system = MESSAGING_SYSTEM,
            messaging.destination_kind = "exchange",
            messaging.operation = "publish",
            messaging.destination.name = self.exchange.as_str(),
            messaging.rabbitmq.routing_key = event_name,
            messaging.attempt = attempt,
        );

        let result = self
            .send(event_name, payload)
            .instrument(span.clone())
            .await;

        if let Err(error) = &result {
            span.record("otel.status_code", "ERROR");
            span.record("exception.message", error.to_string().as_str());
        }
        result
    }

    async fn send(&self, event_name: &str, payload: &[u8]) -> Result<(), BrokerError> {
        if !self.connection.is_open() {
            return Err(BrokerError::Connectivity(
                "connection is not open".to_string(),
            ));
        }

        let channel = self.connection.create_channel().await?;
        let result = self
            .declare_and_publish(channel.as_ref(), event_name, payload)
            .await;
        if let Err(error) = channel.close().await {
            debug!(error = %error, "Closing publish channel failed");
        }
        result
    }

    async fn declare_and_publish(
        &self,
        channel: &dyn BrokerChannel,
        event_name: &str,
        payload: &[u8],
    ) -> Result<(), BrokerError> {
        channel
            .declare_exchange(&self.exchange, ExchangeKind::Direct)
            .await?;

        let mut headers = None;
        self.propagator
            .inject(&Span::current().context(), &mut headers);

        channel
            .publish(
                &self.exchange,
                event_name,
                OutboundMessage::persistent(payload.to_vec(), headers),
            )
            .await
    }
}
