//! Integration tests for the retry coordinator.
//!
//! Drives the coordinator's callback surface against the in-memory broker
//! and validates the full redelivery cycle: republish to a TTL retry queue,
//! broker-side expiry back to the primary queue, and dead-lettering once the
//! retry budget is exhausted. Time is virtual — no test sleeps.

use std::sync::Arc;
use std::time::Duration;

use redrive::testing::MemoryBroker;
use redrive::{
    BrokerChannel, BrokerError, CoordinatorConfig, QueueArguments, RedriveError, RetryCoordinator,
    RetryRouting, DEAD_LETTER_EXCHANGE_ARG, DEAD_LETTER_ROUTING_KEY_ARG,
};
use serde_json::Value;

const QUEUE: &str = "orders";
const EXCHANGE: &str = "events";
const DLX: &str = "events.dlx";

fn dead_letter_arguments() -> QueueArguments {
    let mut arguments = QueueArguments::new();
    arguments.insert(DEAD_LETTER_EXCHANGE_ARG.to_string(), Value::from(DLX));
    arguments.insert(DEAD_LETTER_ROUTING_KEY_ARG.to_string(), Value::from(QUEUE));
    arguments
}

/// Delay strategy used across these scenarios: attempt n waits n/2 seconds.
fn half_second_steps(max_retries: u32) -> CoordinatorConfig {
    CoordinatorConfig::builder(EXCHANGE)
        .delay_fn(|attempt| Duration::from_millis(u64::from(attempt) * 500))
        .max_retries(max_retries)
        .queue_arguments(dead_letter_arguments())
        .build()
        .expect("valid config")
}

/// Declare the primary queue the way a host framework would, then construct
/// the coordinator against it.
async fn coordinator_for(broker: &MemoryBroker, config: CoordinatorConfig) -> RetryCoordinator {
    broker
        .declare_queue(QUEUE, false, &dead_letter_arguments())
        .await
        .expect("primary queue");
    RetryCoordinator::new(Arc::new(broker.clone()), QUEUE, config)
        .await
        .expect("coordinator construction")
}

/// Walks one message through four induced failures under `max_retries = 3`:
/// each failure parks it in exactly one retry queue (0.5 s, then 1 s, then
/// 1.5 s), and the fourth lands it in the error destination.
#[tokio::test]
async fn test_backoff_cycle_until_dead_letter() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(3)).await;

    broker.publish(EXCHANGE, QUEUE, b"payload", None).await.expect("publish");

    // Failure 1: timeout -> 0.5 s retry queue.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("timeout");
    assert_eq!(broker.message_count("orders.retry.0.5"), 1);
    assert_eq!(broker.message_count("orders.retry.1"), 0);
    assert_eq!(broker.message_count("orders.error"), 0);
    assert_eq!(broker.unacked_count(), 0);

    broker.advance(Duration::from_millis(500));
    assert_eq!(broker.message_count(QUEUE), 1);
    assert_eq!(broker.message_count("orders.retry.0.5"), 0);

    // Failure 2: application error -> 1 s retry queue.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    let error = std::io::Error::other("boom");
    coordinator.error(&delivery, &properties, &payload, &error).await.expect("error");
    assert_eq!(broker.message_count("orders.retry.1"), 1);
    assert_eq!(broker.message_count("orders.retry.0.5"), 0);
    assert_eq!(broker.message_count("orders.error"), 0);

    broker.advance(Duration::from_secs(1));
    assert_eq!(broker.message_count(QUEUE), 1);

    // Failure 3: rejection -> 1.5 s retry queue.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    coordinator.reject(&delivery, &properties, &payload, false).await.expect("reject");
    assert_eq!(broker.message_count("orders.retry.1.5"), 1);
    assert_eq!(broker.message_count("orders.retry.1"), 0);
    assert_eq!(broker.message_count("orders.error"), 0);

    broker.advance(Duration::from_millis(1_500));
    assert_eq!(broker.message_count(QUEUE), 1);

    // Failure 4: budget exhausted -> error destination, no retry queue.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("dead-letter");
    assert_eq!(broker.message_count("orders.error"), 1);
    assert_eq!(broker.message_count(QUEUE), 0);
    assert_eq!(broker.message_count("orders.retry.0.5"), 0);
    assert_eq!(broker.message_count("orders.retry.1"), 0);
    assert_eq!(broker.message_count("orders.retry.1.5"), 0);
}

/// Four independent messages failing once each share the single attempt-1
/// retry queue; nothing reaches the error destination.
#[tokio::test]
async fn test_first_failures_share_one_retry_queue() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(2)).await;

    for body in [&b"a"[..], b"b", b"c", b"d"] {
        broker.publish(EXCHANGE, QUEUE, body, None).await.expect("publish");
    }

    for _ in 0..4 {
        let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
        coordinator.reject(&delivery, &properties, &payload, false).await.expect("reject");
    }

    assert_eq!(broker.message_count("orders.retry.0.5"), 4);
    assert_eq!(broker.message_count("orders.error"), 0);
}

/// Messages shoveled straight at the queue through the default exchange go
/// through the same retry cycle and recover on eventual success.
#[tokio::test]
async fn test_shoveled_messages_retry_and_recover() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(2)).await;

    broker.publish("", QUEUE, b"shoveled", None).await.expect("publish");

    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("timeout");
    assert_eq!(broker.message_count("orders.retry.0.5"), 1);

    broker.advance(Duration::from_millis(500));
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    coordinator.acknowledge(&delivery, &properties, &payload).await.expect("ack");

    assert_eq!(broker.message_count(QUEUE), 0);
    assert_eq!(broker.message_count("orders.error"), 0);
    assert_eq!(broker.unacked_count(), 0);
}

/// A successful delivery is acknowledged and leaves no retry state behind.
#[tokio::test]
async fn test_acknowledge_is_terminal() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(2)).await;

    broker.publish(EXCHANGE, QUEUE, b"fine", None).await.expect("publish");
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    coordinator.acknowledge(&delivery, &properties, &payload).await.expect("ack");

    assert_eq!(broker.unacked_count(), 0);
    assert!(!broker.has_queue("orders.retry.0.5"));
}

/// The no-op callback acknowledges nothing and schedules nothing.
#[tokio::test]
async fn test_noop_absorbs_the_delivery() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(2)).await;

    broker.publish(EXCHANGE, QUEUE, b"dup", None).await.expect("publish");
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    coordinator.noop(&delivery, &properties, &payload);

    assert_eq!(broker.unacked_count(), 1);
    assert!(!broker.has_queue("orders.retry.0.5"));
    assert_eq!(broker.message_count("orders.error"), 0);
}

/// Key-preserving topology: retries ride a dedicated retry exchange and the
/// routing key keeps its semantic segments with the delay appended, hop
/// after hop, until exhaustion.
#[tokio::test]
async fn test_key_preserving_routing() {
    let broker = MemoryBroker::new();
    let config = CoordinatorConfig::builder(EXCHANGE)
        .delay_fn(|attempt| Duration::from_millis(u64::from(attempt) * 500))
        .max_retries(2)
        .queue_arguments(dead_letter_arguments())
        .routing(RetryRouting::KeyPreserving)
        .routing_keys(["orders.lifecycle.created"])
        .build()
        .expect("valid config");
    let coordinator = coordinator_for(&broker, config).await;

    assert!(broker.has_exchange("events.retry"));

    broker
        .publish(EXCHANGE, "orders.lifecycle.created", b"payload", None)
        .await
        .expect("publish");

    // Failure 1: the delay token is appended to the semantic key.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    assert_eq!(delivery.routing_key, "orders.lifecycle.created");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("timeout");
    assert_eq!(broker.message_count("orders.retry.0.5"), 1);
    assert_eq!(
        broker.front_routing_key("orders.retry.0.5").as_deref(),
        Some("orders.lifecycle.created.0.5")
    );

    // The broker's return hop preserves the suffixed key.
    broker.advance(Duration::from_millis(500));
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    assert_eq!(delivery.routing_key, "orders.lifecycle.created.0.5");

    // Failure 2: the stale token is stripped before the new one is appended.
    coordinator.reject(&delivery, &properties, &payload, false).await.expect("reject");
    assert_eq!(
        broker.front_routing_key("orders.retry.1").as_deref(),
        Some("orders.lifecycle.created.1")
    );

    // Exhaustion still dead-letters through the primary queue's arguments.
    broker.advance(Duration::from_secs(1));
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("dead-letter");
    assert_eq!(broker.message_count("orders.error"), 1);
}

/// A constant-delay strategy reuses one retry queue across attempts; the
/// broker merges the death history into a single rising count.
#[tokio::test]
async fn test_constant_delay_reuses_one_retry_queue() {
    let broker = MemoryBroker::new();
    let config = CoordinatorConfig::builder(EXCHANGE)
        .delay_fn(|_| Duration::from_secs(1))
        .max_retries(2)
        .queue_arguments(dead_letter_arguments())
        .build()
        .expect("valid config");
    let coordinator = coordinator_for(&broker, config).await;

    broker.publish(EXCHANGE, QUEUE, b"payload", None).await.expect("publish");

    for _ in 0..2 {
        let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
        coordinator.timeout(&delivery, &properties, &payload).await.expect("retry");
        assert_eq!(broker.message_count("orders.retry.1"), 1);
        broker.advance(Duration::from_secs(1));
    }

    // Third failure exceeds the budget of 2.
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("redelivery");
    coordinator.timeout(&delivery, &properties, &payload).await.expect("dead-letter");
    assert_eq!(broker.message_count("orders.error"), 1);
    assert_eq!(broker.message_count("orders.retry.1"), 0);
}

/// A retry queue already declared broker-side with different arguments is a
/// fatal conflict, surfaced to the caller unreconciled.
#[tokio::test]
async fn test_conflicting_retry_queue_is_fatal() {
    let broker = MemoryBroker::new();
    let coordinator = coordinator_for(&broker, half_second_steps(3)).await;

    broker
        .declare_queue("orders.retry.0.5", true, &QueueArguments::new())
        .await
        .expect("conflicting declare");

    broker.publish(EXCHANGE, QUEUE, b"payload", None).await.expect("publish");
    let (delivery, properties, payload) = broker.fetch(QUEUE).expect("delivery");
    let result = coordinator.timeout(&delivery, &properties, &payload).await;

    assert!(matches!(
        result,
        Err(RedriveError::Broker(BrokerError::PreconditionFailed { .. }))
    ));
}
