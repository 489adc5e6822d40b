//! Cross-crate integration scenarios.

pub mod flows;
pub mod resilience;
pub mod tracing_flow;
