//! # Bus Telemetry
//!
//! Observability for the integration bus.
//!
//! ## Components
//!
//! - **Logging**: `tracing` with an env filter and pretty or JSON output
//! - **Tracing**: OpenTelemetry spans exported over OTLP (optional)
//! - **Propagation**: W3C trace context and baggage carried in message headers
//! - **Metrics**: Prometheus counters and histograms for publish and consume
//!
//! ## Usage
//!
//! ```rust,ignore
//! use bus_telemetry::{init_telemetry, TelemetryConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = TelemetryConfig::from_env();
//!     let _guard = init_telemetry(config).expect("Failed to init telemetry");
//!
//!     // Spans, logs and metrics are now being collected
//! }
//! ```
//!
//! ## Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | unset | OTLP endpoint; unset disables export |
//! | `OTEL_SERVICE_NAME` | `integration-bus` | Service name in traces |
//! | `BUS_LOG_LEVEL` | `info` | Log level filter (falls back to `RUST_LOG`) |
//! | `BUS_JSON_LOGS` | `false` | JSON log lines |
//! | `BUS_CONSOLE_OUTPUT` | `true` | Write logs to stdout |

#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod config;
pub mod metrics;
mod propagation;
mod tracing_setup;

pub use config::TelemetryConfig;
pub use metrics::{
    register_metrics, HistogramTimer, MetricsHandle, DELIVERIES_RECEIVED,
    DELIVERIES_UNROUTABLE, EVENTS_PUBLISHED, HANDLER_FAILURES, PUBLISH_DURATION,
    PUBLISH_FAILURES, PUBLISH_RETRIES,
};
pub use propagation::TracePropagator;
pub use tracing_setup::{init_tracing, TracingGuard};

use thiserror::Error;

/// Telemetry initialization errors
#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("Failed to initialize OpenTelemetry tracer: {0}")]
    TracerInit(String),

    #[error("Failed to initialize Prometheus metrics: {0}")]
    MetricsInit(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Initialize logging, tracing and metrics.
///
/// Returns a guard that must be held for the lifetime of the application.
/// When dropped, it flushes pending spans.
pub fn init_telemetry(config: TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    if config.service_name.trim().is_empty() {
        return Err(TelemetryError::Config(
            "service name must not be empty".to_string(),
        ));
    }

    let metrics = register_metrics()?;
    let tracing = init_tracing(&config)?;

    Ok(TelemetryGuard {
        _tracing: tracing,
        metrics,
    })
}

/// Guard that keeps telemetry active. Drop to flush and shutdown.
pub struct TelemetryGuard {
    _tracing: TracingGuard,
    metrics: MetricsHandle,
}

impl TelemetryGuard {
    /// Metrics registered by [`init_telemetry`].
    #[must_use]
    pub fn metrics(&self) -> &MetricsHandle {
        &self.metrics
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        tracing::info!("Shutting down telemetry...");
    }
}
