//! # Subscription Registry
//!
//! Maps an event's logical name (the routing key) to its concrete type and
//! holds the serializer shared by publish and consume.
//!
//! Registration happens once at start-up. The last registration for a name
//! wins; replacing a name with a different type is logged.

use std::any::{Any, TypeId};
use std::collections::BTreeMap;

use tracing::warn;

use crate::event::IntegrationEvent;
use crate::serializer::{EventSerializer, SerializationError};

/// An event decoded by its descriptor, ready for handler dispatch.
pub type DecodedEvent = Box<dyn Any + Send + Sync>;

type DecodeFn = fn(&EventSerializer, &[u8]) -> Result<DecodedEvent, SerializationError>;

fn decode_as<E: IntegrationEvent>(
    serializer: &EventSerializer,
    payload: &[u8],
) -> Result<DecodedEvent, SerializationError> {
    let event: E = serializer.deserialize(payload)?;
    Ok(Box::new(event))
}

/// Everything the consumer needs to know about one registered event type.
#[derive(Debug, Clone, Copy)]
pub struct EventDescriptor {
    name: &'static str,
    type_id: TypeId,
    type_name: &'static str,
    decode: DecodeFn,
}

impl EventDescriptor {
    /// Descriptor for `E`.
    #[must_use]
    pub fn of<E: IntegrationEvent>() -> Self {
        Self {
            name: E::event_name(),
            type_id: TypeId::of::<E>(),
            type_name: std::any::type_name::<E>(),
            decode: decode_as::<E>,
        }
    }

    /// Logical event name.
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// Fully qualified Rust type name.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Decode `payload` into the concrete event type.
    pub fn decode(
        &self,
        serializer: &EventSerializer,
        payload: &[u8],
    ) -> Result<DecodedEvent, SerializationError> {
        (self.decode)(serializer, payload)
    }
}

/// Event name -> event type, plus the shared serializer.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionInfo {
    event_types: BTreeMap<String, EventDescriptor>,
    serializer: EventSerializer,
}

impl SubscriptionInfo {
    #[must_use]
    pub fn new(serializer: EventSerializer) -> Self {
        Self {
            event_types: BTreeMap::new(),
            serializer,
        }
    }

    /// Register `E` under its logical name.
    ///
    /// Returns the descriptor that was replaced, if any.
    pub fn register<E: IntegrationEvent>(&mut self) -> Option<EventDescriptor> {
        let descriptor = EventDescriptor::of::<E>();
        let previous = self
            .event_types
            .insert(descriptor.name().to_string(), descriptor);

        if let Some(previous) = previous {
            if previous.type_id() != descriptor.type_id() {
                warn!(
                    event = descriptor.name(),
                    previous = previous.type_name(),
                    replacement = descriptor.type_name(),
                    "Event name re-registered with a different type"
                );
            }
        }
        previous
    }

    /// Descriptor registered for `name`.
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&EventDescriptor> {
        self.event_types.get(name)
    }

    /// Registered event names, sorted.
    pub fn event_names(&self) -> impl Iterator<Item = &str> {
        self.event_types.keys().map(String::as_str)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.event_types.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.event_types.is_empty()
    }

    /// Serializer used for every event of this bus.
    #[must_use]
    pub fn serializer(&self) -> &EventSerializer {
        &self.serializer
    }

    /// Replace the serializer. Only meaningful before the bus starts.
    pub fn set_serializer(&mut self, serializer: EventSerializer) {
        self.serializer = serializer;
    }
}
