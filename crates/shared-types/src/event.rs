//! # Integration Events
//!
//! The base attributes every integration event carries and the trait that
//! makes a type publishable on the bus.
//!
//! ## Invariants
//!
//! - `id` and `creation_date` are assigned exactly once, at construction.
//! - Reconstruction from wire data keeps the original values; nothing is
//!   regenerated during deserialization.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identity and creation time shared by all integration events.
///
/// Embed it in an event with `#[serde(flatten)]` so both fields appear at the
/// top level of the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    id: Uuid,
    creation_date: DateTime<Utc>,
}

impl EventMetadata {
    /// Create metadata with a fresh v4 identifier and the current UTC time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            creation_date: Utc::now(),
        }
    }

    /// Rebuild metadata from values that were assigned elsewhere.
    #[must_use]
    pub fn from_parts(id: Uuid, creation_date: DateTime<Utc>) -> Self {
        Self { id, creation_date }
    }

    /// Globally unique event identifier.
    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// UTC instant the event was created.
    #[must_use]
    pub fn creation_date(&self) -> DateTime<Utc> {
        self.creation_date
    }
}

impl Default for EventMetadata {
    fn default() -> Self {
        Self::new()
    }
}

/// An event exchanged between services over the bus.
///
/// The logical name doubles as the routing key, so two event types with the
/// same simple name cannot be told apart on the wire.
pub trait IntegrationEvent: Serialize + DeserializeOwned + Debug + Send + Sync + 'static {
    /// Base attributes of this event.
    fn metadata(&self) -> &EventMetadata;

    /// Logical name of the event type (its simple type name).
    fn event_name() -> &'static str
    where
        Self: Sized,
    {
        simple_type_name::<Self>()
    }

    /// Shorthand for `metadata().id()`.
    fn id(&self) -> Uuid {
        self.metadata().id()
    }

    /// Shorthand for `metadata().creation_date()`.
    fn creation_date(&self) -> DateTime<Utc> {
        self.metadata().creation_date()
    }
}

/// Last path segment of a type name, generic arguments removed.
///
/// `orders::events::OrderCreated` becomes `OrderCreated`.
#[must_use]
pub fn simple_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let without_generics = full.split('<').next().unwrap_or(full);
    without_generics
        .rsplit("::")
        .next()
        .unwrap_or(without_generics)
}

/// Implement [`IntegrationEvent`] for structs with a `metadata: EventMetadata` field.
///
/// ```rust,ignore
/// #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// pub struct OrderCreated {
///     #[serde(flatten)]
///     pub metadata: EventMetadata,
///     pub order_id: u64,
/// }
///
/// integration_event!(OrderCreated);
/// ```
#[macro_export]
macro_rules! integration_event {
    ($($event:ty),+ $(,)?) => {
        $(
            impl $crate::IntegrationEvent for $event {
                fn metadata(&self) -> &$crate::EventMetadata {
                    &self.metadata
                }
            }
        )+
    };
}
