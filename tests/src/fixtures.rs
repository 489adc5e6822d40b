//! Shared test fixtures.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize, Serializer};
use shared_bus::{EventBus, EventBusConfig, InMemoryBroker};
use shared_types::{
    integration_event, EventMetadata, HandlerError, IntegrationEvent, IntegrationEventHandler,
};

/// Queue (and subscription client name) used by every fixture bus.
pub const CLIENT: &str = "Ordering";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderCreated {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: u64,
}

impl OrderCreated {
    pub fn new(order_id: u64) -> Self {
        Self {
            metadata: EventMetadata::new(),
            order_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderShipped {
    #[serde(flatten)]
    pub metadata: EventMetadata,
    pub order_id: u64,
    pub carrier: String,
}

impl OrderShipped {
    pub fn new(order_id: u64, carrier: &str) -> Self {
        Self {
            metadata: EventMetadata::new(),
            order_id,
            carrier: carrier.to_string(),
        }
    }
}

/// An event whose encoding always fails.
#[derive(Debug, Deserialize)]
pub struct Corrupt {
    #[serde(flatten)]
    pub metadata: EventMetadata,
}

impl Serialize for Corrupt {
    fn serialize<S: Serializer>(&self, _: S) -> Result<S::Ok, S::Error> {
        Err(serde::ser::Error::custom("corrupt event"))
    }
}

integration_event!(OrderCreated, OrderShipped, Corrupt);

/// Records the order ids it sees, optionally failing on every call.
#[derive(Clone, Default)]
pub struct Recorder {
    seen: Arc<Mutex<Vec<u64>>>,
    fail: bool,
}

impl Recorder {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn seen(&self) -> Vec<u64> {
        self.seen.lock().clone()
    }

    fn record(&self, order_id: u64) -> Result<(), HandlerError> {
        self.seen.lock().push(order_id);
        if self.fail {
            return Err(format!("handler rejected order {order_id}").into());
        }
        Ok(())
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderCreated> for Recorder {
    async fn handle(&self, event: &OrderCreated) -> Result<(), HandlerError> {
        self.record(event.order_id)
    }
}

#[async_trait]
impl IntegrationEventHandler<OrderShipped> for Recorder {
    async fn handle(&self, event: &OrderShipped) -> Result<(), HandlerError> {
        self.record(event.order_id)
    }
}

/// Bus subscribed to `OrderCreated` with `recorder` as its handler.
pub fn order_bus(broker: &InMemoryBroker, recorder: &Recorder) -> EventBus {
    let recorder = recorder.clone();
    EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
        .add_subscription::<OrderCreated, _, _>(move || recorder.clone())
        .build()
}

/// Start `bus` and wait for its consumer to attach.
pub async fn start(bus: &EventBus) {
    bus.start().expect("bus starts");
    let state = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        bus.wait_for_state(|s| *s == shared_bus::ConsumerState::Consuming),
    )
    .await
    .expect("consumer attaches");
    assert_eq!(state, shared_bus::ConsumerState::Consuming);
}

pub fn routing_key<E: IntegrationEvent>() -> &'static str {
    E::event_name()
}
