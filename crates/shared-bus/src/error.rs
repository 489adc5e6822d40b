//! # Bus Errors
//!
//! `BrokerError` is what the broker ports report. `EventBusError` is what
//! callers of the bus see.

use std::time::Duration;

use shared_types::SerializationError;
use thiserror::Error;

/// Failure reported by a broker connection or channel.
#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    /// Broker unreachable, socket failure or a closed connection.
    #[error("broker connectivity failure: {0}")]
    Connectivity(String),

    /// Exchange, queue or binding declaration rejected.
    #[error("topology declaration failed: {0}")]
    Topology(String),

    /// Channel-level protocol error.
    #[error("channel error: {0}")]
    Channel(String),

    /// Acknowledgement could not be delivered.
    #[error("acknowledgement failed: {0}")]
    Ack(String),
}

impl BrokerError {
    /// Whether the failure is connectivity-class and worth retrying.
    #[must_use]
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connectivity(_))
    }
}

/// Errors surfaced by the event bus.
#[derive(Debug, Error)]
pub enum EventBusError {
    #[error("failed to serialize {event}: {source}")]
    Serialization {
        event: &'static str,
        #[source]
        source: SerializationError,
    },

    #[error("failed to publish {event} after {attempts} attempt(s): {source}")]
    Publish {
        event: &'static str,
        attempts: u32,
        #[source]
        source: BrokerError,
    },

    #[error("publish of {event} was cancelled")]
    Cancelled { event: &'static str },

    #[error("event bus consumer already started")]
    AlreadyStarted,

    #[error("event bus has been shut down")]
    ShutDown,

    #[error("consumer did not stop within {0:?}")]
    ShutdownTimeout(Duration),
}

impl EventBusError {
    /// Broker failure behind a publish error, if any.
    #[must_use]
    pub fn broker_error(&self) -> Option<&BrokerError> {
        match self {
            Self::Publish { source, .. } => Some(source),
            _ => None,
        }
    }
}
