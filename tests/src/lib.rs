//! # Integration Bus Test Suite
//!
//! Cross-crate scenarios run against the in-memory broker.
//!
//! ## Structure
//!
//! ```text
//! tests/src/
//! ├── fixtures.rs       # Shared events, handlers and bus builders
//! └── integration/
//!     ├── flows.rs      # Publish → route → consume → acknowledge
//!     ├── resilience.rs # Retry, cancellation and shutdown
//!     └── tracing_flow.rs # Trace context across the broker
//!
//! benches/
//! └── bus_benchmarks.rs # Serializer and publish throughput
//! ```
//!
//! ## Running Tests
//!
//! ```bash
//! cargo test -p bus-tests
//! cargo test -p bus-tests integration::resilience::
//! cargo bench -p bus-tests
//! ```

#![allow(dead_code)]

pub mod fixtures;
pub mod integration;
