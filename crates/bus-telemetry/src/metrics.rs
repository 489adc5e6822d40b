//! Prometheus metrics for the integration bus.
//!
//! All metrics follow the naming convention: `bus_<subject>_<metric>_<unit>`
//!
//! ## Metric Types
//!
//! - **Counter**: Monotonically increasing value (e.g., events_published_total)
//! - **Histogram**: Distribution of values (e.g., publish_duration_seconds)

use lazy_static::lazy_static;
use prometheus::{
    exponential_buckets, CounterVec, Encoder, Histogram, IntCounter, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

use crate::TelemetryError;

lazy_static! {
    /// Global metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // =========================================================================
    // PUBLISH METRICS
    // =========================================================================

    /// Events accepted by the broker
    pub static ref EVENTS_PUBLISHED: CounterVec = CounterVec::new(
        Opts::new("bus_events_published_total", "Events published to the broker"),
        &["event"]
    ).expect("metric creation failed");

    /// Publish attempts repeated after a connectivity failure
    pub static ref PUBLISH_RETRIES: CounterVec = CounterVec::new(
        Opts::new("bus_publish_retries_total", "Publish attempts retried after a connectivity failure"),
        &["event"]
    ).expect("metric creation failed");

    /// Publishes that failed after exhausting retries (or failed non-retryably)
    pub static ref PUBLISH_FAILURES: CounterVec = CounterVec::new(
        Opts::new("bus_publish_failures_total", "Publishes that ultimately failed"),
        &["event"]
    ).expect("metric creation failed");

    /// Publish duration, including retries
    pub static ref PUBLISH_DURATION: Histogram = Histogram::with_opts(
        prometheus::HistogramOpts::new(
            "bus_publish_duration_seconds",
            "Time spent publishing an event, including retries"
        ).buckets(exponential_buckets(0.0005, 2.0, 18).unwrap_or_default())
    ).expect("metric creation failed");

    // =========================================================================
    // CONSUME METRICS
    // =========================================================================

    /// Deliveries received, labeled by routing key
    pub static ref DELIVERIES_RECEIVED: CounterVec = CounterVec::new(
        Opts::new("bus_deliveries_received_total", "Deliveries received from the broker"),
        &["event"]
    ).expect("metric creation failed");

    /// Deliveries whose routing key has no registered event type
    pub static ref DELIVERIES_UNROUTABLE: IntCounter = IntCounter::new(
        "bus_deliveries_unroutable_total",
        "Deliveries with an unregistered routing key"
    ).expect("metric creation failed");

    /// Handler invocations that returned an error
    pub static ref HANDLER_FAILURES: CounterVec = CounterVec::new(
        Opts::new("bus_handler_failures_total", "Handler invocations that failed"),
        &["event"]
    ).expect("metric creation failed");
}

/// Handle to the bus metrics registry.
#[derive(Clone)]
pub struct MetricsHandle {
    registry: Arc<Registry>,
}

impl MetricsHandle {
    /// Render every registered metric in the Prometheus text format.
    pub fn gather_text(&self) -> Result<String, TelemetryError> {
        encode_registry(&self.registry)
    }
}

/// Register all metrics with the global registry.
///
/// Safe to call more than once; metrics already registered are kept.
pub fn register_metrics() -> Result<MetricsHandle, TelemetryError> {
    let metrics: Vec<Box<dyn prometheus::core::Collector>> = vec![
        // Publish
        Box::new(EVENTS_PUBLISHED.clone()),
        Box::new(PUBLISH_RETRIES.clone()),
        Box::new(PUBLISH_FAILURES.clone()),
        Box::new(PUBLISH_DURATION.clone()),
        // Consume
        Box::new(DELIVERIES_RECEIVED.clone()),
        Box::new(DELIVERIES_UNROUTABLE.clone()),
        Box::new(HANDLER_FAILURES.clone()),
    ];

    for metric in metrics {
        match REGISTRY.register(metric) {
            Ok(()) | Err(prometheus::Error::AlreadyReg) => {}
            Err(e) => return Err(TelemetryError::MetricsInit(e.to_string())),
        }
    }

    Ok(MetricsHandle {
        registry: Arc::new(REGISTRY.clone()),
    })
}

fn encode_registry(registry: &Registry) -> Result<String, TelemetryError> {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| TelemetryError::MetricsInit(e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| TelemetryError::MetricsInit(e.to_string()))
}

/// Timer guard for automatic histogram observation.
pub struct HistogramTimer {
    histogram: Histogram,
    start: std::time::Instant,
}

impl HistogramTimer {
    /// Start a new timer for the given histogram.
    #[must_use]
    pub fn new(histogram: &Histogram) -> Self {
        Self {
            histogram: histogram.clone(),
            start: std::time::Instant::now(),
        }
    }
}

impl Drop for HistogramTimer {
    fn drop(&mut self) {
        let duration = self.start.elapsed().as_secs_f64();
        self.histogram.observe(duration);
    }
}

/// Start timing for a histogram. Observation happens on drop.
#[macro_export]
macro_rules! time_histogram {
    ($histogram:expr) => {
        $crate::metrics::HistogramTimer::new(&$histogram)
    };
}
