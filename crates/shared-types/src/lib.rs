//! # Shared Types Crate
//!
//! The event model every service on the bus agrees on.
//!
//! ## Contents
//!
//! - `event` - `EventMetadata` and the `IntegrationEvent` trait
//! - `serializer` - the Serialization Adapter (one codec configuration for
//!   publish and consume)
//! - `subscription` - event name -> event type registry
//! - `handler` - event type -> handler factories
//! - `headers` - message metadata carried on the wire
//!
//! ## Design Principles
//!
//! - **Single Source of Truth**: publishers and consumers share these types.
//! - **Identity is assigned once**: an event's id and creation date never
//!   change after construction, including across the wire.
//! - **No reflection**: event types and handlers are registered explicitly.

// Allow in tests
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod event;
pub mod handler;
pub mod headers;
pub mod serializer;
pub mod subscription;

pub use event::{simple_type_name, EventMetadata, IntegrationEvent};
pub use handler::{ErasedHandler, HandlerError, HandlerRegistry, IntegrationEventHandler};
pub use headers::{HeaderValue, MessageHeaders};
pub use serializer::{
    EventSerializer, NamingPolicy, ParseNamingPolicyError, SerializationError, SerializerOptions,
};
pub use subscription::{DecodedEvent, EventDescriptor, SubscriptionInfo};
