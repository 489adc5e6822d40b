//! # Event Handlers
//!
//! Handlers are registered per event type in an explicit table built at
//! start-up. Each registration stores a factory, and every delivery resolves
//! fresh handler instances, so nothing a handler holds outlives the delivery
//! that created it.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::event::IntegrationEvent;

/// Error returned by a handler. Handlers own their error types; the bus only
/// logs them.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Reacts to one integration event type.
#[async_trait]
pub trait IntegrationEventHandler<E: IntegrationEvent>: Send + Sync {
    /// Handle a decoded event.
    async fn handle(&self, event: &E) -> Result<(), HandlerError>;
}

/// Type-erased handler as stored in the registry.
#[async_trait]
pub trait ErasedHandler: Send + Sync {
    /// Rust type name of the concrete handler, for logs.
    fn handler_name(&self) -> &'static str;

    /// Handle an event decoded by the matching `EventDescriptor`.
    async fn handle_erased(&self, event: &(dyn Any + Send + Sync)) -> Result<(), HandlerError>;
}

struct TypedHandler<E, H> {
    handler: H,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, H> ErasedHandler for TypedHandler<E, H>
where
    E: IntegrationEvent,
    H: IntegrationEventHandler<E> + 'static,
{
    fn handler_name(&self) -> &'static str {
        std::any::type_name::<H>()
    }

    async fn handle_erased(&self, event: &(dyn Any + Send + Sync)) -> Result<(), HandlerError> {
        let event = event.downcast_ref::<E>().ok_or_else(|| {
            HandlerError::from(format!(
                "{} expects {}",
                std::any::type_name::<H>(),
                E::event_name()
            ))
        })?;
        self.handler.handle(event).await
    }
}

type HandlerFactory = Arc<dyn Fn() -> Box<dyn ErasedHandler> + Send + Sync>;

/// Event type -> handler factories.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    factories: HashMap<TypeId, Vec<HandlerFactory>>,
}

impl HandlerRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for `E`. The factory runs once per delivery.
    pub fn register<E, H, F>(&mut self, factory: F)
    where
        E: IntegrationEvent,
        H: IntegrationEventHandler<E> + 'static,
        F: Fn() -> H + Send + Sync + 'static,
    {
        let factory: HandlerFactory = Arc::new(move || {
            Box::new(TypedHandler::<E, H> {
                handler: factory(),
                _event: PhantomData,
            }) as Box<dyn ErasedHandler>
        });
        self.factories
            .entry(TypeId::of::<E>())
            .or_default()
            .push(factory);
    }

    /// Build new instances of every handler registered for `event_type`,
    /// in registration order.
    #[must_use]
    pub fn resolve(&self, event_type: TypeId) -> Vec<Box<dyn ErasedHandler>> {
        self.factories
            .get(&event_type)
            .map(|factories| factories.iter().map(|make| make()).collect())
            .unwrap_or_default()
    }

    /// Number of handlers registered for `event_type`.
    #[must_use]
    pub fn handler_count(&self, event_type: TypeId) -> usize {
        self.factories.get(&event_type).map_or(0, Vec::len)
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("event_types", &self.factories.len())
            .field(
                "handlers",
                &self.factories.values().map(Vec::len).sum::<usize>(),
            )
            .finish()
    }
}
