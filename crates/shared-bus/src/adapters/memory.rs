//! # In-Memory Broker
//!
//! An in-process broker with exchange/queue/binding semantics close enough
//! to AMQP for the bus to run unchanged against it:
//!
//! - publishing to an undeclared exchange is a channel error
//! - a direct exchange routes a message to every queue bound with its key
//! - messages with no matching binding are dropped
//! - each queue buffers messages FIFO until its (single) consumer attaches
//!
//! Faults can be injected to exercise retry and error paths, and every
//! publish and acknowledgement is recorded for inspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use shared_types::MessageHeaders;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::error::BrokerError;
use crate::ports::{
    Acknowledger, BrokerChannel, BrokerConnection, Delivery, DeliveryStream, ExchangeKind,
    FaultObserver, OutboundMessage, QueueOptions,
};

/// A message accepted by the broker, as recorded for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub headers: Option<MessageHeaders>,
    pub persistent: bool,
    /// Queues the message was routed to.
    pub routed_to: Vec<String>,
}

struct StoredMessage {
    delivery_tag: u64,
    routing_key: String,
    payload: Vec<u8>,
    headers: Option<MessageHeaders>,
}

struct QueueState {
    options: QueueOptions,
    sender: mpsc::UnboundedSender<StoredMessage>,
    /// Taken by the first consumer.
    receiver: Option<mpsc::UnboundedReceiver<StoredMessage>>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeKind>,
    queues: HashMap<String, QueueState>,
    /// exchange -> (routing key, queue)
    bindings: HashMap<String, Vec<(String, String)>>,
}

#[derive(Default)]
struct Faults {
    failing_channels: u32,
    failing_publishes: u32,
    failing_declarations: bool,
}

struct BrokerState {
    open: AtomicBool,
    topology: Mutex<Topology>,
    faults: Mutex<Faults>,
    fault_observers: Mutex<Vec<FaultObserver>>,
    published: Mutex<Vec<PublishedMessage>>,
    acks: Mutex<HashMap<u64, usize>>,
    ack_total: watch::Sender<usize>,
    next_delivery_tag: AtomicU64,
    channels_opened: AtomicUsize,
    channels_closed: AtomicUsize,
    publish_calls: AtomicUsize,
}

/// In-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    #[must_use]
    pub fn new() -> Self {
        let (ack_total, _) = watch::channel(0);
        Self {
            state: Arc::new(BrokerState {
                open: AtomicBool::new(true),
                topology: Mutex::new(Topology::default()),
                faults: Mutex::new(Faults::default()),
                fault_observers: Mutex::new(Vec::new()),
                published: Mutex::new(Vec::new()),
                acks: Mutex::new(HashMap::new()),
                ack_total,
                next_delivery_tag: AtomicU64::new(1),
                channels_opened: AtomicUsize::new(0),
                channels_closed: AtomicUsize::new(0),
                publish_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// The broker as a shared connection.
    #[must_use]
    pub fn connection(&self) -> Arc<dyn BrokerConnection> {
        Arc::new(self.clone())
    }

    // =========================================================================
    // FAULT INJECTION
    // =========================================================================

    /// Open or close the connection. A closed connection refuses channels.
    pub fn set_open(&self, open: bool) {
        self.state.open.store(open, Ordering::SeqCst);
    }

    /// Fail the next `count` channel creations with a connectivity error.
    pub fn fail_next_channels(&self, count: u32) {
        self.state.faults.lock().failing_channels = count;
    }

    /// Fail the next `count` publishes with a connectivity error.
    pub fn fail_next_publishes(&self, count: u32) {
        self.state.faults.lock().failing_publishes = count;
    }

    /// Make every exchange and queue declaration fail.
    pub fn fail_declarations(&self, fail: bool) {
        self.state.faults.lock().failing_declarations = fail;
    }

    /// Report an asynchronous channel fault to every registered observer.
    pub fn raise_channel_fault(&self, reason: &str) {
        for observer in self.state.fault_observers.lock().iter() {
            observer(BrokerError::Channel(reason.to_string()));
        }
    }

    /// Put a raw message on `queue`, bypassing exchanges. Returns its tag.
    pub fn inject_delivery(
        &self,
        queue: &str,
        routing_key: &str,
        payload: impl Into<Vec<u8>>,
        headers: Option<MessageHeaders>,
    ) -> Result<u64, BrokerError> {
        let topology = self.state.topology.lock();
        let queue_state = topology
            .queues
            .get(queue)
            .ok_or_else(|| BrokerError::Channel(format!("no queue '{queue}'")))?;
        let delivery_tag = self.state.next_tag();
        queue_state
            .sender
            .send(StoredMessage {
                delivery_tag,
                routing_key: routing_key.to_string(),
                payload: payload.into(),
                headers,
            })
            .map_err(|_| BrokerError::Channel(format!("queue '{queue}' is gone")))?;
        Ok(delivery_tag)
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Every message the broker accepted, in order.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state.published.lock().clone()
    }

    /// Publish calls received, including failed ones.
    #[must_use]
    pub fn publish_calls(&self) -> usize {
        self.state.publish_calls.load(Ordering::SeqCst)
    }

    /// How many times `delivery_tag` was acknowledged.
    #[must_use]
    pub fn ack_count(&self, delivery_tag: u64) -> usize {
        self.state
            .acks
            .lock()
            .get(&delivery_tag)
            .copied()
            .unwrap_or(0)
    }

    /// Acknowledgements received across all deliveries.
    #[must_use]
    pub fn total_acks(&self) -> usize {
        *self.state.ack_total.borrow()
    }

    /// Wait until at least `count` acknowledgements have been received.
    pub async fn wait_for_acks(&self, count: usize) {
        let mut total = self.state.ack_total.subscribe();
        // The sender lives as long as the broker, so this only ends on success.
        let _ = total.wait_for(|acked| *acked >= count).await;
    }

    #[must_use]
    pub fn exchange_kind(&self, exchange: &str) -> Option<ExchangeKind> {
        self.state.topology.lock().exchanges.get(exchange).copied()
    }

    #[must_use]
    pub fn queue_options(&self, queue: &str) -> Option<QueueOptions> {
        self.state
            .topology
            .lock()
            .queues
            .get(queue)
            .map(|q| q.options)
    }

    /// Routing keys `queue` is bound with on `exchange`, sorted.
    #[must_use]
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        let topology = self.state.topology.lock();
        let mut keys: Vec<String> = topology
            .bindings
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(_, bound)| bound == queue)
                    .map(|(key, _)| key.clone())
                    .collect()
            })
            .unwrap_or_default();
        keys.sort();
        keys
    }

    /// Channels currently open.
    #[must_use]
    pub fn open_channels(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
            - self.state.channels_closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn channels_opened(&self) -> usize {
        self.state.channels_opened.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerState {
    fn next_tag(&self) -> u64 {
        self.next_delivery_tag.fetch_add(1, Ordering::SeqCst)
    }

    fn check_declarations(&self) -> Result<(), BrokerError> {
        if self.faults.lock().failing_declarations {
            return Err(BrokerError::Topology("declaration refused".to_string()));
        }
        Ok(())
    }

    fn record_ack(&self, delivery_tag: u64) {
        *self.acks.lock().entry(delivery_tag).or_insert(0) += 1;
        self.ack_total.send_modify(|total| *total += 1);
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    async fn create_channel(&self) -> Result<Box<dyn BrokerChannel>, BrokerError> {
        if !self.is_open() {
            return Err(BrokerError::Connectivity("connection is closed".to_string()));
        }
        {
            let mut faults = self.state.faults.lock();
            if faults.failing_channels > 0 {
                faults.failing_channels -= 1;
                return Err(BrokerError::Connectivity(
                    "connection refused".to_string(),
                ));
            }
        }

        let id = self.state.channels_opened.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(channel = id, "Channel opened");
        Ok(Box::new(MemoryChannel {
            state: self.state.clone(),
            id,
            closed: AtomicBool::new(false),
        }))
    }
}

struct MemoryChannel {
    state: Arc<BrokerState>,
    id: usize,
    closed: AtomicBool,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel(format!("channel {} is closed", self.id)));
        }
        if !self.state.open.load(Ordering::SeqCst) {
            return Err(BrokerError::Connectivity("connection is closed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.check_declarations()?;

        // Redeclaring is a no-op.
        self.state
            .topology
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_insert(kind);
        Ok(())
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), BrokerError> {
        self.ensure_open()?;
        self.state.check_declarations()?;

        let mut topology = self.state.topology.lock();
        if !topology.queues.contains_key(name) {
            let (sender, receiver) = mpsc::unbounded_channel();
            topology.queues.insert(
                name.to_string(),
                QueueState {
                    options,
                    sender,
                    receiver: Some(receiver),
                },
            );
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        self.ensure_open()?;

        let mut topology = self.state.topology.lock();
        if !topology.exchanges.contains_key(exchange) {
            return Err(BrokerError::Topology(format!("no exchange '{exchange}'")));
        }
        if !topology.queues.contains_key(queue) {
            return Err(BrokerError::Topology(format!("no queue '{queue}'")));
        }
        let bindings = topology.bindings.entry(exchange.to_string()).or_default();
        let binding = (routing_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        message: OutboundMessage,
    ) -> Result<(), BrokerError> {
        self.state.publish_calls.fetch_add(1, Ordering::SeqCst);
        self.ensure_open()?;
        {
            let mut faults = self.state.faults.lock();
            if faults.failing_publishes > 0 {
                faults.failing_publishes -= 1;
                return Err(BrokerError::Connectivity("socket closed".to_string()));
            }
        }

        let topology = self.state.topology.lock();
        let kind = topology
            .exchanges
            .get(exchange)
            .copied()
            .ok_or_else(|| BrokerError::Channel(format!("no exchange '{exchange}'")))?;

        let mut routed_to: Vec<String> = topology
            .bindings
            .get(exchange)
            .map(|bindings| {
                bindings
                    .iter()
                    .filter(|(key, _)| match kind {
                        ExchangeKind::Direct => key == routing_key,
                    })
                    .map(|(_, queue)| queue.clone())
                    .collect()
            })
            .unwrap_or_default();
        routed_to.sort();
        routed_to.dedup();

        for queue in &routed_to {
            if let Some(queue_state) = topology.queues.get(queue) {
                // A dropped receiver means the consumer went away; the message is lost.
                let _ = queue_state.sender.send(StoredMessage {
                    delivery_tag: self.state.next_tag(),
                    routing_key: routing_key.to_string(),
                    payload: message.payload.clone(),
                    headers: message.headers.clone(),
                });
            }
        }

        self.state.published.lock().push(PublishedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            payload: message.payload,
            headers: message.headers,
            persistent: message.persistent,
            routed_to,
        });
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream, BrokerError> {
        self.ensure_open()?;

        let receiver = {
            let mut topology = self.state.topology.lock();
            let queue_state = topology
                .queues
                .get_mut(queue)
                .ok_or_else(|| BrokerError::Channel(format!("no queue '{queue}'")))?;
            queue_state.receiver.take().ok_or_else(|| {
                BrokerError::Channel(format!("queue '{queue}' already has a consumer"))
            })?
        };
        debug!(queue, consumer_tag, channel = self.id, "Consumer attached");

        let state = self.state.clone();
        let stream = UnboundedReceiverStream::new(receiver).map(move |message| {
            Ok(Delivery::new(
                message.delivery_tag,
                message.routing_key,
                message.payload,
                message.headers,
                Box::new(MemoryAcker {
                    state: state.clone(),
                }),
            ))
        });
        Ok(stream.boxed())
    }

    fn on_fault(&self, observer: FaultObserver) {
        self.state.fault_observers.lock().push(observer);
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.channels_closed.fetch_add(1, Ordering::SeqCst);
            debug!(channel = self.id, "Channel closed");
        }
        Ok(())
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError> {
        self.state.record_ack(delivery_tag);
        Ok(())
    }
}
