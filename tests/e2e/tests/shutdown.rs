//! Graceful stop

use broker::{BrokerOp, ConfirmBehavior, MemoryBroker};
use relay_e2e_tests::{temperature_reading, RelayHarness, TestConfig};
use types::{CloseReason, ConnectionState};

#[tokio::test]
async fn test_stop_reports_unconfirmed_deliveries() {
    let broker = MemoryBroker::new();
    broker.set_confirm_behavior(ConfirmBehavior::Hold);
    let mut harness = RelayHarness::start_on(broker, TestConfig::default()).await;

    harness.send(&temperature_reading());
    harness
        .wait_until("publish", || harness.server.publisher_stats().published == 1)
        .await;

    let unconfirmed = harness.shutdown().await;
    assert_eq!(unconfirmed.len(), 1);
    assert_eq!(unconfirmed[0].sequence, 1);

    assert_eq!(harness.server.supervisor().state(), ConnectionState::Closed);
    assert_eq!(harness.broker.open_connections(), 0);
    assert!(harness.server.stop().await.is_empty());
}

#[tokio::test]
async fn test_stop_cancels_consumer_before_closing_connection() {
    let mut harness = RelayHarness::start().await;
    harness.shutdown().await;

    let ops = harness.broker.ops();
    let cancel = ops
        .iter()
        .position(|op| matches!(op, BrokerOp::Cancel { .. }))
        .unwrap();
    let closes: Vec<_> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| matches!(op, BrokerOp::CloseConnection { .. }))
        .map(|(index, _)| index)
        .collect();

    assert_eq!(closes.len(), 1);
    assert!(cancel < closes[0]);
    assert_eq!(harness.broker.consumer_count(&harness.inbound().queue), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stop_during_reconnect_wait_ends_supervision() {
    let mut harness = RelayHarness::start().await;

    harness
        .broker
        .drop_connections(CloseReason::connection_lost("broker restarted"));
    harness
        .wait_until("connection failure", || {
            matches!(
                harness.server.supervisor().state(),
                ConnectionState::Failed(_)
            )
        })
        .await;

    harness.shutdown().await;
    assert_eq!(harness.server.supervisor().state(), ConnectionState::Closed);
    assert_eq!(harness.broker.connect_times().len(), 1);
}
