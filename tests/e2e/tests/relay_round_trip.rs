//! Inbound message in, wrapped envelope out

use broker::{ConfirmBehavior, MemoryBroker};
use relay_e2e_tests::{
    assert_wrapped, numbered_reading, temperature_reading, RelayHarness, TestConfig,
    MALFORMED_BODY,
};
use std::collections::HashSet;

#[tokio::test]
async fn test_temperature_reading_is_wrapped() {
    let mut harness = RelayHarness::start().await;
    let reading = temperature_reading();

    harness.send(&reading);
    harness.wait_outbound(1).await;
    harness
        .wait_until("confirmation", || harness.server.publisher_stats().acked == 1)
        .await;

    let outbound = harness.outbound_messages();
    assert_eq!(outbound.len(), 1);
    let id = assert_wrapped(&outbound[0], &reading).unwrap();
    assert_ne!(id.to_string(), "X");

    assert_eq!(harness.broker.queue_depth(&harness.inbound().queue), 0);
    assert_eq!(harness.broker.unacked_count(&harness.inbound().queue), 0);
    assert!(harness.shutdown().await.is_empty());
}

#[tokio::test]
async fn test_messages_keep_order_and_get_distinct_ids() {
    let mut harness = RelayHarness::start().await;
    let readings: Vec<_> = (1..=5).map(numbered_reading).collect();

    for reading in &readings {
        harness.send(reading);
    }
    harness.wait_outbound(readings.len()).await;

    let outbound = harness.outbound_messages();
    let ids: HashSet<_> = outbound
        .iter()
        .zip(&readings)
        .map(|(body, reading)| assert_wrapped(body, reading).unwrap())
        .collect();
    assert_eq!(ids.len(), readings.len());
    harness
        .wait_until("forward count", || harness.server.forwarded() == 5)
        .await;

    harness.shutdown().await;
}

#[tokio::test]
async fn test_malformed_message_is_dropped_and_relay_continues() {
    let mut harness = RelayHarness::start().await;

    harness.send_raw(MALFORMED_BODY);
    harness.send(&temperature_reading());
    harness
        .wait_until("both settled", || {
            harness.server.consumer().settled_counts() == (1, 1)
        })
        .await;

    assert_eq!(harness.outbound_messages().len(), 1);
    assert_eq!(harness.broker.queue_depth(&harness.inbound().queue), 0);

    harness.shutdown().await;
}

#[tokio::test]
async fn test_broker_nack_is_counted_not_retried() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Nack);
    let mut harness = RelayHarness::start_on(broker, TestConfig::default()).await;

    harness.send(&temperature_reading());
    harness
        .wait_until("nack", || harness.server.publisher_stats().nacked == 1)
        .await;

    let stats = harness.server.publisher_stats();
    assert_eq!(stats.published, 1);
    assert_eq!(stats.acked, 0);
    assert_eq!(stats.pending, 0);
    assert!(harness.outbound_messages().is_empty());
    assert_eq!(harness.server.consumer().settled_counts(), (1, 0));

    harness.shutdown().await;
}
