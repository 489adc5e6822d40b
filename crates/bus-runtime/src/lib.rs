//! # Integration Bus Runtime
//!
//! Host process for a service on the integration bus.
//!
//! ## Modular Structure
//!
//! - `config` - runtime configuration from the environment
//! - `events` - integration events this service publishes and consumes
//! - `handlers` - handlers for the subscribed events
//! - `runtime` - wiring of the bus with its subscriptions
//!
//! ## Startup Sequence
//!
//! 1. Load configuration (environment)
//! 2. Initialize telemetry (logs, traces, metrics)
//! 3. Connect to the broker (with retries)
//! 4. Build the bus with its subscriptions and start the consumer
//! 5. Optionally publish a demo event
//! 6. Wait for Ctrl-C, shut the bus down, close the connection

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

pub mod config;
pub mod events;
pub mod handlers;
pub mod runtime;

pub use config::{RuntimeConfig, RuntimeConfigError};
pub use events::{OrderCreated, OrderPaid};
pub use handlers::{OrderCreatedHandler, OrderLedger, OrderPaidHandler};
pub use runtime::BusRuntime;
