//! # Resilience
//!
//! Publish retries with exponential backoff (2s, 4s, 8s, ...), permanent
//! failures that are never retried, and shutdown aborting in-flight work.
//!
//! Timing tests run on a paused clock, so backoff is observed exactly.

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use shared_bus::{ConsumerState, EventBus, EventBusConfig, EventBusError, InMemoryBroker};
    use shared_types::EventMetadata;
    use tokio::time::{sleep, timeout, Instant};
    use tokio_util::sync::CancellationToken;

    use crate::fixtures::{order_bus, start, Corrupt, OrderCreated, Recorder, CLIENT};

    fn publishing_bus(broker: &InMemoryBroker, retry_count: u32) -> EventBus {
        let config = EventBusConfig {
            retry_count,
            ..EventBusConfig::for_client(CLIENT)
        };
        EventBus::builder(broker.connection(), config).build()
    }

    #[tokio::test(start_paused = true)]
    async fn test_three_failures_then_success_waits_2_4_8_seconds() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(3);
        let bus = Arc::new(publishing_bus(&broker, 5));
        let started = Instant::now();

        let publishing = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish(&OrderCreated::new(1)).await })
        };

        // Check between attempts: they are due at 0s, 2s, 6s and 14s.
        let mut calls = Vec::new();
        for at_secs in [1, 3, 7, 15] {
            sleep(Duration::from_millis(at_secs * 1000 + 1) - started.elapsed()).await;
            calls.push(broker.publish_calls());
        }

        publishing.await.unwrap().unwrap();
        assert_eq!(calls, vec![1, 2, 3, 4]);
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_backoff_before_success() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(3);
        let bus = publishing_bus(&broker, 5);
        let started = Instant::now();

        bus.publish(&OrderCreated::new(2)).await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(14));
        assert_eq!(broker.publish_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retry_budget_surfaces_the_last_error() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(u32::MAX);
        let bus = publishing_bus(&broker, 3);
        let started = Instant::now();

        let err = bus.publish(&OrderCreated::new(3)).await.unwrap_err();

        match err {
            EventBusError::Publish {
                event,
                attempts,
                source,
            } => {
                assert_eq!(event, "OrderCreated");
                assert_eq!(attempts, 4);
                assert!(source.is_connectivity());
            }
            other => panic!("unexpected error: {other}"),
        }
        // 2 + 4 + 8
        assert_eq!(started.elapsed(), Duration::from_secs(14));
        assert_eq!(broker.publish_calls(), 4);
    }

    #[tokio::test]
    async fn test_serialization_failure_is_never_retried() {
        let broker = InMemoryBroker::new();
        let bus = publishing_bus(&broker, 5);

        let err = bus
            .publish(&Corrupt {
                metadata: EventMetadata::new(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, EventBusError::Serialization { event: "Corrupt", .. }));
        assert_eq!(broker.publish_calls(), 0);
        assert_eq!(broker.channels_opened(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_caller_cancellation_aborts_backoff() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(u32::MAX);
        let bus = publishing_bus(&broker, 5);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(3)).await;
            trigger.cancel();
        });

        let err = bus
            .publish_with_cancellation(&OrderCreated::new(4), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, EventBusError::Cancelled { event: "OrderCreated" }));
        // First attempt at 0s, second at 2s, cancelled during the 4s wait.
        assert_eq!(broker.publish_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_aborts_in_flight_publish() {
        let broker = InMemoryBroker::new();
        broker.fail_next_publishes(u32::MAX);
        let bus = Arc::new(publishing_bus(&broker, 5));

        let publishing = {
            let bus = Arc::clone(&bus);
            tokio::spawn(async move { bus.publish(&OrderCreated::new(5)).await })
        };
        sleep(Duration::from_secs(1)).await;
        bus.shutdown().await.unwrap();

        let err = publishing.await.unwrap().unwrap_err();
        assert!(matches!(err, EventBusError::Cancelled { .. }));
        assert_eq!(broker.publish_calls(), 1);
    }

    #[tokio::test]
    async fn test_consumer_setup_failure_leaves_publishing_usable() {
        let broker = InMemoryBroker::new();
        broker.fail_declarations(true);
        let recorder = Recorder::default();
        let bus = order_bus(&broker, &recorder);

        bus.start().unwrap();
        let state = timeout(
            Duration::from_secs(1),
            bus.wait_for_state(ConsumerState::is_terminal),
        )
        .await
        .unwrap();
        assert!(matches!(state, ConsumerState::Errored(_)));
        assert_eq!(broker.open_channels(), 0);

        broker.fail_declarations(false);
        bus.publish(&OrderCreated::new(6)).await.unwrap();
        assert_eq!(broker.published().len(), 1);
        bus.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_the_consumer_channel() {
        let broker = InMemoryBroker::new();
        let recorder = Recorder::default();
        let bus = order_bus(&broker, &recorder);
        start(&bus).await;
        assert_eq!(broker.open_channels(), 1);

        bus.shutdown().await.unwrap();

        assert_eq!(bus.consumer_state(), ConsumerState::Stopped);
        assert_eq!(broker.open_channels(), 0);
    }
}
