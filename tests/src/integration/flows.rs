//! # Publish → Consume Flows
//!
//! Events published through one bus are routed by the broker to the
//! subscription queue and dispatched by the same bus's consumer.
//!
//! Every delivery is acknowledged exactly once, whatever its handlers did.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{EventBus, EventBusConfig, InMemoryBroker, EXCHANGE_NAME};
    use shared_types::{EventSerializer, NamingPolicy, SerializerOptions};
    use tokio::time::timeout;

    use crate::fixtures::{order_bus, start, OrderCreated, OrderShipped, Recorder, CLIENT};

    const WAIT: Duration = Duration::from_secs(1);

    // =========================================================================
    // HAPPY PATH
    // =========================================================================

    #[tokio::test]
    async fn test_order_created_is_handled_once_and_acknowledged() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let bus = order_bus(&broker, &recorder);
        start(&bus).await;

        bus.publish(&OrderCreated::new(123)).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(1)).await.unwrap();

        assert_eq!(recorder.seen(), vec![123]);
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].routing_key, "OrderCreated");
        assert_eq!(published[0].routed_to, vec![CLIENT.to_string()]);
        assert_eq!(broker.total_acks(), 1);

        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_topology_is_durable_direct_and_bound_per_event() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let orders = recorder.clone();
        let shipments = recorder.clone();
        let bus = EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
            .add_subscription::<OrderCreated, _, _>(move || orders.clone())
            .add_subscription::<OrderShipped, _, _>(move || shipments.clone())
            .build();
        start(&bus).await;

        assert_eq!(
            broker.exchange_kind(EXCHANGE_NAME),
            Some(shared_bus::ExchangeKind::Direct)
        );
        let options = broker.queue_options(CLIENT).unwrap();
        assert!(options.durable);
        assert!(!options.exclusive);
        assert!(!options.auto_delete);
        assert_eq!(
            broker.bindings(EXCHANGE_NAME, CLIENT),
            vec!["OrderCreated".to_string(), "OrderShipped".to_string()]
        );

        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_every_registered_handler_runs_in_order() {
        let broker = InMemoryBroker::new();
        let first = Recorder::default();
        let second = Recorder::default();
        let (a, b) = (first.clone(), second.clone());
        let bus = EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
            .add_subscription::<OrderCreated, _, _>(move || a.clone())
            .add_subscription::<OrderCreated, _, _>(move || b.clone())
            .build();
        start(&bus).await;

        bus.publish(&OrderCreated::new(5)).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(1)).await.unwrap();

        assert_eq!(first.seen(), vec![5]);
        assert_eq!(second.seen(), vec![5]);
        assert_eq!(broker.bindings(EXCHANGE_NAME, CLIENT), vec!["OrderCreated"]);
        bus.shutdown().await.unwrap();
    }

    // =========================================================================
    // DROPPED DELIVERIES
    // =========================================================================

    #[tokio::test]
    async fn test_unregistered_routing_key_is_acknowledged_without_dispatch() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let bus = order_bus(&broker, &recorder);
        start(&bus).await;

        let tag = broker
            .inject_delivery(CLIENT, "InvoiceIssued", r#"{"order_id":1}"#, None)
            .unwrap();
        timeout(WAIT, broker.wait_for_acks(1)).await.unwrap();

        assert_eq!(broker.ack_count(tag), 1);
        assert!(recorder.seen().is_empty());
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_undecodable_payloads_are_acknowledged_and_consumption_continues() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let bus = order_bus(&broker, &recorder);
        start(&bus).await;

        let not_utf8 = broker
            .inject_delivery(CLIENT, "OrderCreated", vec![0xff, 0xfe, 0x00], None)
            .unwrap();
        let not_json = broker
            .inject_delivery(CLIENT, "OrderCreated", "not json", None)
            .unwrap();
        bus.publish(&OrderCreated::new(9)).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(3)).await.unwrap();

        assert_eq!(broker.ack_count(not_utf8), 1);
        assert_eq!(broker.ack_count(not_json), 1);
        assert_eq!(recorder.seen(), vec![9]);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_failing_handler_does_not_stop_the_others_or_the_ack() {
        let broker = InMemoryBroker::new();
        let failing = Recorder::failing();
        let healthy = Recorder::default();
        let (f, h) = (failing.clone(), healthy.clone());
        let bus = EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
            .add_subscription::<OrderCreated, _, _>(move || f.clone())
            .add_subscription::<OrderCreated, _, _>(move || h.clone())
            .build();
        start(&bus).await;

        bus.publish(&OrderCreated::new(1)).await.unwrap();
        bus.publish(&OrderCreated::new(2)).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(2)).await.unwrap();

        assert_eq!(failing.seen(), vec![1, 2]);
        assert_eq!(healthy.seen(), vec![1, 2]);
        assert_eq!(broker.total_acks(), 2);
        bus.shutdown().await.unwrap();
    }

    // =========================================================================
    // CONCURRENCY AND SERIALIZATION
    // =========================================================================

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_publishes_are_all_delivered() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let bus = Arc::new(order_bus(&broker, &recorder));
        start(&bus).await;

        let publishers: Vec<_> = (0..32u64)
            .map(|order_id| {
                let bus = Arc::clone(&bus);
                tokio::spawn(async move { bus.publish(&OrderCreated::new(order_id)).await })
            })
            .collect();
        for publisher in publishers {
            publisher.await.unwrap().unwrap();
        }
        timeout(Duration::from_secs(5), broker.wait_for_acks(32))
            .await
            .unwrap();

        let mut seen = recorder.seen();
        seen.sort_unstable();
        assert_eq!(seen, (0..32).collect::<Vec<_>>());
        assert_eq!(broker.open_channels(), 1, "only the consumer channel stays open");
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_camel_case_wire_format_round_trips() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let handler = recorder.clone();
        let bus = EventBus::builder(broker.connection(), EventBusConfig::for_client(CLIENT))
            .add_subscription::<OrderShipped, _, _>(move || handler.clone())
            .configure_serializer(|options| options.naming = NamingPolicy::CamelCase)
            .build();
        start(&bus).await;

        let event = OrderShipped::new(77, "dhl");
        bus.publish(&event).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(1)).await.unwrap();

        let payload = &broker.published()[0].payload;
        let body = std::str::from_utf8(payload).unwrap();
        assert!(body.contains("\"orderId\":77"));
        assert!(!body.contains("order_id"));

        let decoded: OrderShipped = EventSerializer::new(SerializerOptions {
            naming: NamingPolicy::CamelCase,
            ..SerializerOptions::default()
        })
        .deserialize(payload)
        .unwrap();
        assert_eq!(decoded, event);
        assert_eq!(recorder.seen(), vec![77]);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_publisher_without_subscriptions_still_delivers_to_other_services() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let consumer = order_bus(&broker, &recorder);
        start(&consumer).await;
        let publisher = EventBus::builder(broker.connection(), EventBusConfig::for_client("Billing"))
            .build();

        publisher.publish(&OrderCreated::new(31)).await.unwrap();
        timeout(WAIT, broker.wait_for_acks(1)).await.unwrap();

        assert_eq!(recorder.seen(), vec![31]);
        publisher.shutdown().await.unwrap();
        consumer.shutdown().await.unwrap();
    }
}
