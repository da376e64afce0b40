//! Relay test harness

use broker::{BrokerOp, MemoryBroker};
use relay_server::RelayServer;
use reliability::{ConsumerState, ReliabilityError};
use serde_json::Value;
use service_config::RelayServiceConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use types::Topology;

#[derive(Debug, Clone)]
pub struct TestConfig {
    /// Upper bound for any single wait
    pub timeout: Duration,
    /// Poll interval while waiting
    pub poll_interval: Duration,
    /// Relay configuration
    pub relay: RelayServiceConfig,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            poll_interval: Duration::from_millis(10),
            relay: RelayServiceConfig::default(),
        }
    }
}

/// A running relay wired to an in-process broker
pub struct RelayHarness {
    pub broker: MemoryBroker,
    pub server: Arc<RelayServer>,
    pub config: TestConfig,
    task: Option<JoinHandle<Result<(), ReliabilityError>>>,
}

impl RelayHarness {
    /// Start the relay with default settings and wait until it consumes
    pub async fn start() -> Self {
        Self::start_with(TestConfig::default()).await
    }

    pub async fn start_with(config: TestConfig) -> Self {
        Self::start_on(MemoryBroker::new(), config).await
    }

    /// Start against a prepared broker
    pub async fn start_on(broker: MemoryBroker, config: TestConfig) -> Self {
        init_test_logging();
        let server = Arc::new(RelayServer::new(&config.relay, Arc::new(broker.clone())));
        let task = {
            let server = server.clone();
            tokio::spawn(async move { server.run().await })
        };

        let harness = Self {
            broker,
            server,
            config,
            task: Some(task),
        };
        harness.wait_consuming().await;
        harness
    }

    pub fn inbound(&self) -> &Topology {
        &self.config.relay.inbound
    }

    pub fn outbound(&self) -> &Topology {
        &self.config.relay.outbound
    }

    /// Publish a raw body to the inbound exchange as an external sender would
    pub fn send_raw(&self, body: impl AsRef<[u8]>) {
        let inbound = self.inbound();
        self.broker
            .publish(&inbound.exchange, &inbound.routing_key, body)
            .expect("inbound exchange exists");
    }

    pub fn send(&self, message: &Value) {
        self.send_raw(message.to_string());
    }

    /// Bodies waiting on the outbound queue
    pub fn outbound_messages(&self) -> Vec<Vec<u8>> {
        self.broker.queued_messages(&self.outbound().queue)
    }

    pub async fn wait_until(&self, what: &str, mut check: impl FnMut() -> bool) {
        let poll = self.config.poll_interval;
        let waited = tokio::time::timeout(self.config.timeout, async {
            while !check() {
                tokio::time::sleep(poll).await;
            }
        })
        .await;
        assert!(waited.is_ok(), "timed out waiting for {what}");
    }

    pub async fn wait_consuming(&self) {
        self.wait_until("consumer to start", || {
            self.server.consumer().state() == ConsumerState::Consuming
        })
        .await;
    }

    pub async fn wait_outbound(&self, count: usize) {
        self.wait_until("outbound messages", || {
            self.broker.queue_depth(&self.outbound().queue) >= count
        })
        .await;
    }

    /// Index of the `nth` (0-based) successful connect in the broker's log
    pub fn connect_index(ops: &[BrokerOp], nth: usize) -> Option<usize> {
        ops.iter()
            .enumerate()
            .filter(|(_, op)| matches!(op, BrokerOp::Connect { .. }))
            .nth(nth)
            .map(|(index, _)| index)
    }

    /// Stop the relay and wait for its supervision loop to end
    pub async fn shutdown(&mut self) -> Vec<types::DeliveryRecord> {
        let unconfirmed = self.server.stop().await;
        if let Some(task) = self.task.take() {
            task.await
                .expect("relay task panicked")
                .expect("relay ended with error");
        }
        unconfirmed
    }
}

fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
