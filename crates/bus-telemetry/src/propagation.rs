//! Trace context propagation across the broker.
//!
//! When an event crosses a process boundary, the publisher's span context and
//! baggage are written into the message headers, and the consumer rebuilds
//! them so its spans become children of the publisher's span.
//!
//! ## Wire format
//!
//! W3C Trace Context (`traceparent`, `tracestate`) and W3C Baggage
//! (`baggage`), all as string-valued headers.
//!
//! ## Example
//!
//! ```rust,ignore
//! // Publisher
//! let propagator = TracePropagator::new();
//! let mut headers = None;
//! propagator.inject(&span.context(), &mut headers);
//!
//! // Consumer
//! let parent = propagator.extract(delivery.headers.as_ref());
//! receive_span.set_parent(parent);
//! ```

use opentelemetry::propagation::{
    Extractor, Injector, TextMapCompositePropagator, TextMapPropagator,
};
use opentelemetry::Context;
use opentelemetry_sdk::propagation::{BaggagePropagator, TraceContextPropagator};
use shared_types::MessageHeaders;

/// Writes and reads trace context and baggage in message headers.
pub struct TracePropagator {
    inner: TextMapCompositePropagator,
}

impl TracePropagator {
    /// Create a propagator for W3C trace context plus W3C baggage.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: composite_propagator(),
        }
    }

    /// Write `cx` into `headers`, creating the header map if it is absent.
    pub fn inject(&self, cx: &Context, headers: &mut Option<MessageHeaders>) {
        let headers = headers.get_or_insert_with(MessageHeaders::new);
        self.inner.inject_context(cx, &mut HeaderInjector(headers));
    }

    /// Rebuild the context carried by `headers`.
    ///
    /// Extraction starts from an empty root context. Missing or malformed
    /// headers produce a context without a span rather than an error.
    #[must_use]
    pub fn extract(&self, headers: Option<&MessageHeaders>) -> Context {
        match headers {
            Some(headers) => self
                .inner
                .extract_with_context(&Context::new(), &HeaderExtractor(headers)),
            None => Context::new(),
        }
    }

    /// Header names this propagator reads and writes.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.inner.fields()
    }
}

impl Default for TracePropagator {
    fn default() -> Self {
        Self::new()
    }
}

/// The composite propagator, also installed globally by `init_telemetry`.
pub(crate) fn composite_propagator() -> TextMapCompositePropagator {
    TextMapCompositePropagator::new(vec![
        Box::new(TraceContextPropagator::new()),
        Box::new(BaggagePropagator::new()),
    ])
}

struct HeaderInjector<'a>(&'a mut MessageHeaders);

impl Injector for HeaderInjector<'_> {
    fn set(&mut self, key: &str, value: String) {
        self.0.insert(key, value);
    }
}

struct HeaderExtractor<'a>(&'a MessageHeaders);

impl Extractor for HeaderExtractor<'_> {
    fn get(&self, key: &str) -> Option<&str> {
        self.0.get_str(key)
    }

    fn keys(&self) -> Vec<&str> {
        self.0.keys().collect()
    }
}
