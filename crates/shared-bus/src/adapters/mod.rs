//! # Broker Adapters
//!
//! - `memory` - in-process broker with fault injection, used by tests
//! - `amqp` - RabbitMQ through `lapin` (feature `amqp`)

pub mod memory;

#[cfg(feature = "amqp")]
pub mod amqp;
