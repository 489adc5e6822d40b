//! # Broker Ports
//!
//! The bus core talks to the broker only through these traits. The shared
//! connection is supplied from outside; publisher and consumer open their own
//! channels from it and never close the connection itself.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use shared_types::MessageHeaders;

use crate::error::BrokerError;

/// Routing semantics of an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Routing key must equal the binding key.
    Direct,
}

/// Queue declaration flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
}

impl QueueOptions {
    /// Durable, shared, long-lived queue: what a subscribing service uses.
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
        }
    }
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self::durable()
    }
}

/// A message about to be published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub headers: Option<MessageHeaders>,
    /// Ask the broker to keep the message across restarts.
    pub persistent: bool,
}

impl OutboundMessage {
    #[must_use]
    pub fn persistent(payload: Vec<u8>, headers: Option<MessageHeaders>) -> Self {
        Self {
            payload,
            headers,
            persistent: true,
        }
    }
}

/// Settles deliveries on the channel they arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;
}

/// An inbound message. Lives for one consume-and-acknowledge cycle.
pub struct Delivery {
    pub delivery_tag: u64,
    /// The event's logical name.
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Option<MessageHeaders>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    #[must_use]
    pub fn new(
        delivery_tag: u64,
        routing_key: impl Into<String>,
        payload: Vec<u8>,
        headers: Option<MessageHeaders>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            routing_key: routing_key.into(),
            payload,
            headers,
            acker,
        }
    }

    /// Acknowledge this delivery. Consumes it, so it cannot be acked twice.
    pub async fn ack(self) -> Result<(), BrokerError> {
        self.acker.ack(self.delivery_tag).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("routing_key", &self.routing_key)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Deliveries pushed by the broker to one consumer.
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Callback for asynchronous channel faults (e.g. broker-initiated closure).
pub type FaultObserver = Box<dyn Fn(BrokerError) + Send + Sync>;

/// Shared broker connection.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Whether the connection is currently usable.
    fn is_open(&self) -> bool;

    /// Open a new channel on this connection.
    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError>;
}

/// A channel on the shared connection.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Idempotently declare an exchange.
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError>;

    /// Idempotently declare a queue.
    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError>;

    /// Start consuming `queue` with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError>;

    /// Register an observer for asynchronous channel faults.
    fn on_fault(&self, observer: FaultObserver);

    async fn close(&self) -> Result<(), BrokerError>;
}
