//! # Trace Context Across the Broker
//!
//! The producer span's context travels in the message headers, so the
//! consumer's receive span (and everything a handler does inside it) joins
//! the publisher's trace. Span names, kinds and status fields follow the
//! `tracing-opentelemetry` conventions (`otel.name`, `otel.kind`,
//! `otel.status_code`).

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fmt;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use opentelemetry::trace::{TraceContextExt, TraceId, TracerProvider as _};
    use parking_lot::Mutex;
    use shared_bus::{EventBus, EventBusConfig, InMemoryBroker};
    use shared_types::{HandlerError, IntegrationEventHandler, MessageHeaders};
    use tokio::time::timeout;
    use tracing::field::{Field, Visit};
    use tracing::span::{Attributes, Id, Record};
    use tracing::{info_span, Instrument, Span, Subscriber};
    use tracing_opentelemetry::OpenTelemetrySpanExt;
    use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

    use crate::fixtures::{order_bus, start, OrderCreated, Recorder, CLIENT};

    /// Records the trace each invocation ran in.
    #[derive(Clone, Default)]
    struct TraceCapture(Arc<Mutex<Vec<TraceId>>>);

    #[async_trait]
    impl IntegrationEventHandler<OrderCreated> for TraceCapture {
        async fn handle(&self, _event: &OrderCreated) -> Result<(), HandlerError> {
            let trace_id = Span::current().context().span().span_context().trace_id();
            self.0.lock().push(trace_id);
            Ok(())
        }
    }

    /// Every span's fields as recorded, in creation order.
    #[derive(Clone, Default)]
    struct SpanRecorder(Arc<Mutex<Vec<(Id, BTreeMap<String, String>)>>>);

    impl SpanRecorder {
        fn named(&self, otel_name: &str) -> Vec<BTreeMap<String, String>> {
            self.0
                .lock()
                .iter()
                .filter(|(_, fields)| fields.get("otel.name").map(String::as_str) == Some(otel_name))
                .map(|(_, fields)| fields.clone())
                .collect()
        }
    }

    struct FieldWriter<'a>(&'a mut BTreeMap<String, String>);

    impl Visit for FieldWriter<'_> {
        fn record_str(&mut self, field: &Field, value: &str) {
            self.0.insert(field.name().to_string(), value.to_string());
        }

        fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
            self.0.insert(field.name().to_string(), format!("{value:?}"));
        }
    }

    impl<S: Subscriber> Layer<S> for SpanRecorder {
        fn on_new_span(&self, attrs: &Attributes<'_>, id: &Id, _ctx: Context<'_, S>) {
            let mut fields = BTreeMap::new();
            attrs.record(&mut FieldWriter(&mut fields));
            self.0.lock().push((id.clone(), fields));
        }

        fn on_record(&self, id: &Id, values: &Record<'_>, _ctx: Context<'_, S>) {
            let mut spans = self.0.lock();
            // Ids are reused once a span closes; the latest one is live.
            if let Some((_, fields)) = spans.iter_mut().rev().find(|(span, _)| span == id) {
                values.record(&mut FieldWriter(fields));
            }
        }
    }

    fn install_recorder() -> (SpanRecorder, tracing::subscriber::DefaultGuard) {
        let recorder = SpanRecorder::default();
        let subscriber = tracing_subscriber::registry().with(recorder.clone());
        (recorder, tracing::subscriber::set_default(subscriber))
    }

    fn install_tracer() -> tracing::subscriber::DefaultGuard {
        let provider = opentelemetry_sdk::trace::TracerProvider::builder().build();
        let subscriber = tracing_subscriber::registry()
            .with(tracing_opentelemetry::layer().with_tracer(provider.tracer("bus-tests")));
        tracing::subscriber::set_default(subscriber)
    }

    fn traced_bus(broker: &InMemoryBroker, capture: &TraceCapture) -> EventBus {
        let capture = capture.clone();
        EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
            .add_subscription::<OrderCreated, _, _>(move || capture.clone())
            .build()
    }

    #[tokio::test]
    async fn test_handler_runs_in_the_publishers_trace() {
        let _guard = install_tracer();
        let broker = InMemoryBroker::new();
        let capture = TraceCapture::default();
        let bus = traced_bus(&broker, &capture);
        start(&bus).await;

        let checkout = info_span!("checkout");
        let trace_id = checkout.context().span().span_context().trace_id();
        bus.publish(&OrderCreated::new(123))
            .instrument(checkout)
            .await
            .unwrap();
        timeout(Duration::from_secs(1), broker.wait_for_acks(1))
            .await
            .unwrap();

        assert_ne!(trace_id, TraceId::INVALID);
        assert_eq!(*capture.0.lock(), vec![trace_id]);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_incoming_traceparent_becomes_the_parent() {
        let _guard = install_tracer();
        let broker = InMemoryBroker::new();
        let capture = TraceCapture::default();
        let bus = traced_bus(&broker, &capture);
        start(&bus).await;

        let mut headers = MessageHeaders::new();
        headers.insert(
            "traceparent",
            "00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
        );
        broker
            .inject_delivery(
                CLIENT,
                "OrderCreated",
                r#"{"id":"0b5e8e3c-6c1f-4a7e-9d7c-2f1e4c2b9a11","creation_date":"2024-05-01T12:00:00Z","order_id":8}"#,
                Some(headers),
            )
            .unwrap();
        timeout(Duration::from_secs(1), broker.wait_for_acks(1))
            .await
            .unwrap();

        let expected = TraceId::from_hex("0af7651916cd43dd8448eb211c80319c").unwrap();
        assert_eq!(*capture.0.lock(), vec![expected]);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_headers_start_a_fresh_trace() {
        let _guard = install_tracer();
        let broker = InMemoryBroker::new();
        let capture = TraceCapture::default();
        let bus = traced_bus(&broker, &capture);
        start(&bus).await;

        broker
            .inject_delivery(
                CLIENT,
                "OrderCreated",
                r#"{"id":"0b5e8e3c-6c1f-4a7e-9d7c-2f1e4c2b9a12","creation_date":"2024-05-01T12:00:00Z","order_id":9}"#,
                None,
            )
            .unwrap();
        timeout(Duration::from_secs(1), broker.wait_for_acks(1))
            .await
            .unwrap();

        let traces = capture.0.lock().clone();
        assert_eq!(traces.len(), 1);
        assert_ne!(traces[0], TraceId::INVALID);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_spans_carry_names_kinds_and_payload() {
        let (spans, _guard) = install_recorder();
        let broker = InMemoryBroker::new();
        let bus = order_bus(&broker, &Recorder::default());
        start(&bus).await;

        bus.publish(&OrderCreated::new(41)).await.unwrap();
        timeout(Duration::from_secs(1), broker.wait_for_acks(1))
            .await
            .unwrap();
        bus.shutdown().await.unwrap();

        let publish = spans.named("OrderCreated Publish");
        assert_eq!(publish.len(), 1);
        assert_eq!(publish[0]["otel.kind"], "producer");
        assert_eq!(publish[0]["messaging.rabbitmq.routing_key"], "OrderCreated");
        assert!(!publish[0].contains_key("otel.status_code"));

        let receive = spans.named("OrderCreated receive");
        assert_eq!(receive.len(), 1);
        assert_eq!(receive[0]["otel.kind"], "consumer");
        assert_eq!(receive[0]["messaging.destination.name"], CLIENT);
        assert!(receive[0]["message"].contains("\"order_id\":41"));
        assert!(!receive[0].contains_key("otel.status_code"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_mark_spans_as_errors() {
        let (spans, _guard) = install_recorder();
        let broker = InMemoryBroker::new();
        let bus = order_bus(&broker, &Recorder::failing());
        start(&bus).await;

        broker.fail_next_publishes(1);
        bus.publish(&OrderCreated::new(42)).await.unwrap();
        timeout(Duration::from_secs(1), broker.wait_for_acks(1))
            .await
            .unwrap();
        bus.shutdown().await.unwrap();

        // One failed attempt, then the retry that went through.
        let publish = spans.named("OrderCreated Publish");
        assert_eq!(publish.len(), 2);
        assert_eq!(publish[0]["otel.status_code"], "ERROR");
        assert!(publish[0].contains_key("exception.message"));
        assert!(!publish[1].contains_key("otel.status_code"));

        let receive = spans.named("OrderCreated receive");
        assert_eq!(receive.len(), 1);
        assert_eq!(receive[0]["otel.status_code"], "ERROR");
        assert!(receive[0]["exception.message"].contains("rejected order 42"));
        assert!(receive[0]["message"].contains("\"order_id\":42"));
    }
}
