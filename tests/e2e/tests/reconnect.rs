//! Connection loss and recovery

use broker::BrokerOp;
use relay_e2e_tests::{assert_wrapped, numbered_reading, temperature_reading, RelayHarness};
use std::time::Duration;
use tokio::time::Instant;
use types::CloseReason;

fn position(ops: &[BrokerOp], pred: fn(&BrokerOp) -> bool) -> usize {
    ops.iter().position(pred).expect("operation recorded")
}

async fn wait_reconnected(harness: &RelayHarness, connects: u64) {
    let queue = harness.inbound().queue.clone();
    harness
        .wait_until("reconnect", || {
            harness.server.supervisor().stats().successful_connects == connects
                && harness.broker.consumer_count(&queue) == 1
        })
        .await;
}

#[tokio::test(start_paused = true)]
async fn test_reconnects_after_fixed_delay_and_redeclares_topology() {
    let mut harness = RelayHarness::start().await;

    let dropped_at = Instant::now();
    harness
        .broker
        .drop_connections(CloseReason::connection_lost("broker restarted"));
    wait_reconnected(&harness, 2).await;

    let times = harness.broker.connect_times();
    assert_eq!(times.len(), 2);
    let waited = times[1] - dropped_at;
    assert!(waited >= Duration::from_secs(5), "reconnected after {waited:?}");
    assert!(waited < Duration::from_secs(6), "reconnected after {waited:?}");

    let ops = harness.broker.ops();
    let start = RelayHarness::connect_index(&ops, 1).unwrap();
    let session = &ops[start..];

    let declare = position(session, |op| matches!(op, BrokerOp::ExchangeDeclare { .. }));
    let confirm = position(session, |op| matches!(op, BrokerOp::ConfirmSelect { .. }));
    let consume = position(session, |op| matches!(op, BrokerOp::Consume { .. }));
    let last_bind = session
        .iter()
        .rposition(|op| matches!(op, BrokerOp::QueueBind { .. }))
        .unwrap();
    let binds = session
        .iter()
        .filter(|op| matches!(op, BrokerOp::QueueBind { .. }))
        .count();

    assert_eq!(binds, 2);
    assert!(declare < confirm);
    assert!(last_bind < consume);

    // Relay works on the new connection
    let reading = temperature_reading();
    harness.send(&reading);
    harness.wait_outbound(1).await;
    assert_wrapped(&harness.outbound_messages()[0], &reading).unwrap();

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_messages_sent_during_outage_are_relayed() {
    let mut harness = RelayHarness::start().await;

    harness.broker.refuse_next_connects(2);
    harness
        .broker
        .drop_connections(CloseReason::connection_lost("network unreachable"));

    let readings: Vec<_> = (1..=3).map(numbered_reading).collect();
    for reading in &readings {
        harness.send(reading);
    }
    assert_eq!(harness.broker.queue_depth(&harness.inbound().queue), 3);

    wait_reconnected(&harness, 2).await;
    harness.wait_outbound(readings.len()).await;

    for (body, reading) in harness.outbound_messages().iter().zip(&readings) {
        assert_wrapped(body, reading).unwrap();
    }

    let stats = harness.server.supervisor().stats();
    assert_eq!(stats.connect_attempts, 4);
    assert_eq!(stats.reconnects_scheduled, 3);

    // Each refused attempt waited the fixed delay
    let times = harness.broker.connect_times();
    assert_eq!(times.len(), 4);
    for pair in times[1..].windows(2) {
        assert_eq!(pair[1] - pair[0], Duration::from_secs(5));
    }

    harness.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_remote_consumer_cancel_triggers_reconnect() {
    let mut harness = RelayHarness::start().await;
    let queue = harness.inbound().queue.clone();

    assert_eq!(harness.broker.cancel_consumers(&queue), 1);
    wait_reconnected(&harness, 2).await;

    let reading = temperature_reading();
    harness.send(&reading);
    harness.wait_outbound(1).await;
    assert_wrapped(&harness.outbound_messages()[0], &reading).unwrap();

    harness.shutdown().await;
}
