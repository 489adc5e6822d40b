//! # Shared Bus - Broker-Backed Integration Event Bus
//!
//! Lets independent services exchange typed integration events over a
//! message broker.
//!
//! ## Flow
//!
//! ```text
//! caller ──publish()──→ ResilientPublisher ──(retry)──→ exchange
//!                                                          │ routing key = event name
//!                                                          ▼
//!                                              subscription queue
//!                                                          │
//! handlers ←──dispatch── BackgroundConsumer ←──deliveries──┘
//!                               │
//!                               └──ack (always, exactly once)
//! ```
//!
//! ## Modules
//!
//! - `ports` - broker connection/channel/delivery traits
//! - `retry` - exponential backoff on connectivity failures
//! - `publisher` - serialization, topology, trace injection, retries
//! - `consumer` - queue setup, trace extraction, handler dispatch, acks
//! - `bus` - lifecycle facade composing publisher and consumer
//! - `adapters` - in-memory broker and the RabbitMQ adapter (`amqp` feature)
//!
//! ## Delivery Guarantees
//!
//! - **Publish:** at-least-once. A retried publish may reach the broker twice.
//! - **Consume:** every delivery is acknowledged once, whether or not its
//!   handlers succeed. Failed deliveries are logged and dropped.

// Nursery lints that are too strict
#![allow(clippy::missing_const_for_fn)]
// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::panic))]

pub mod adapters;
pub mod bus;
pub mod config;
pub mod consumer;
pub mod error;
pub mod ports;
pub mod publisher;
pub mod retry;

// Re-export main types
pub use adapters::memory::{InMemoryBroker, PublishedMessage};
pub use bus::{EventBus, EventBusBuilder};
pub use config::{ConfigError, EventBusConfig};
pub use consumer::{BackgroundConsumer, ConsumerState, DeliveryOutcome};
pub use error::{BrokerError, EventBusError};
pub use ports::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
    FaultObserver, OutboundMessage, QueueOptions,
};
pub use publisher::ResilientPublisher;
pub use retry::{RetryError, RetryPolicy};

#[cfg(feature = "amqp")]
pub use adapters::amqp::AmqpConnectionManager;

/// Exchange every integration event is published to.
pub const EXCHANGE_NAME: &str = "integration_event_bus";

/// Publish retries after the first attempt.
pub const DEFAULT_RETRY_COUNT: u32 = 5;

/// Upper bound accepted for the configured retry count.
pub const MAX_RETRY_COUNT: u32 = 10;

/// Queue name used when none is configured.
pub const DEFAULT_SUBSCRIPTION_CLIENT_NAME: &str = "integration-bus";

/// Value of `messaging.system` on bus spans.
pub const MESSAGING_SYSTEM: &str = "rabbitmq";
