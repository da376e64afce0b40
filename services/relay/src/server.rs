//! # Relay Server
//!
//! Bridges the inbound queue to the outbound exchange over one supervised
//! connection. Each connection session:
//!
//! 1. opens the publisher channel, ensures the outbound topology and enables
//!    confirms
//! 2. opens the consumer channel, ensures the inbound topology and subscribes
//! 3. loops on one `select!`, biased toward shutdown and connection loss,
//!    serializing confirmation handling and delivery forwarding
//!
//! Every inbound payload is republished verbatim inside a new envelope
//! (`{"data": <payload>, "_id": "<uuid>"}`), then the delivery is settled
//! according to the consumer's ack mode.

use async_trait::async_trait;
use broker::{BrokerConnection, ConfirmationStream, Connector, Delivery, DeliveryStream};
use futures::StreamExt;
use reliability::{
    ConnectionSession, ConnectionSupervisor, ConsumerChannel, PublisherChannel, PublisherStats,
    ReliabilityError, Result, SessionEnd, Settlement, TopologyManager,
};
use service_config::RelayServiceConfig;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{DeliveryRecord, InboundMessage};

pub struct RelayServer {
    supervisor: ConnectionSupervisor,
    topology: TopologyManager,
    publisher: PublisherChannel,
    consumer: ConsumerChannel,
    stopped: AtomicBool,
    forwarded: AtomicU64,
}

impl std::fmt::Debug for RelayServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayServer")
            .field("supervisor", &self.supervisor)
            .field("publisher", &self.publisher.stats())
            .field("consumer", &self.consumer.state())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish()
    }
}

impl RelayServer {
    pub fn new(config: &RelayServiceConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            supervisor: ConnectionSupervisor::new(
                connector,
                config.broker.url.clone(),
                config.reconnect_policy(),
            ),
            topology: TopologyManager::new(config.rpc_timeout()),
            publisher: PublisherChannel::new(config.outbound.clone(), config.publisher_options()),
            consumer: ConsumerChannel::new(config.inbound.clone(), config.consumer_options()),
            stopped: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
        }
    }

    pub fn supervisor(&self) -> &ConnectionSupervisor {
        &self.supervisor
    }

    pub fn publisher(&self) -> &PublisherChannel {
        &self.publisher
    }

    pub fn consumer(&self) -> &ConsumerChannel {
        &self.consumer
    }

    pub fn publisher_stats(&self) -> PublisherStats {
        self.publisher.stats()
    }

    /// Inbound messages republished so far
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    /// Serve until [`RelayServer::stop`] is called or reconnecting gives up
    pub async fn run(&self) -> Result<()> {
        info!("Relay starting");
        self.supervisor.supervise(self).await
    }

    /// Shut down in order: flag, consumer, publisher, connection.
    ///
    /// Returns the deliveries that were still awaiting confirmation.
    /// Idempotent; later calls return nothing.
    pub async fn stop(&self) -> Vec<DeliveryRecord> {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return Vec::new();
        }
        info!("Relay stopping");
        self.supervisor.request_shutdown();

        if let Err(err) = self.consumer.cancel().await {
            warn!(error = %err, "Error cancelling consumer");
        }

        let unconfirmed = match self.publisher.close().await {
            Ok(()) => Vec::new(),
            Err(ReliabilityError::DeliveryUnconfirmed { records }) => {
                for record in &records {
                    warn!(
                        sequence = record.sequence,
                        envelope_id = %record.envelope_id,
                        "Delivery unconfirmed at shutdown"
                    );
                }
                records
            }
            Err(err) => {
                warn!(error = %err, "Error closing publisher");
                Vec::new()
            }
        };

        self.supervisor.close().await;
        info!(stats = %self.publisher.stats(), "Relay stopped");
        unconfirmed
    }

    async fn setup(
        &self,
        supervisor: &ConnectionSupervisor,
    ) -> Result<(ConfirmationStream, DeliveryStream)> {
        self.topology.reset();

        let publisher_handle = supervisor.open_channel().await?;
        let confirms = self.publisher.attach(publisher_handle, &self.topology).await?;

        let consumer_handle = supervisor.open_channel().await?;
        let deliveries = self.consumer.attach(consumer_handle, &self.topology).await?;

        Ok((confirms, deliveries))
    }

    async fn forward(&self, message: InboundMessage) -> Result<()> {
        if self.supervisor.is_shutting_down() {
            return Err(ReliabilityError::ChannelUnavailable);
        }

        let delivery_tag = message.delivery_tag;
        let sequence = self.publisher.publish(message.payload).await?;
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        debug!(
            delivery_tag,
            sequence,
            message_id = message.message_id.as_deref().unwrap_or("-"),
            "Message forwarded"
        );
        Ok(())
    }

    /// Forward one delivery and settle it. An error ends the session.
    async fn handle_delivery(&self, delivery: Delivery) -> Result<()> {
        let delivery_tag = delivery.delivery_tag;
        let outcome = match self.consumer.accept(&delivery) {
            Ok(message) => self.forward(message).await,
            Err(err) => Err(err),
        };

        if let Err(err) = &outcome {
            warn!(delivery_tag, error = %err, "Failed to relay message");
        }

        match self.consumer.settle(delivery_tag, &outcome).await {
            Ok(Settlement::Acked) => {}
            Ok(settlement) => debug!(delivery_tag, ?settlement, "Delivery not acknowledged"),
            Err(ReliabilityError::AlreadySettled(_)) => {}
            Err(err) => return Err(err),
        }

        // Publisher channel gone: requeued deliveries would fail again
        match outcome {
            Err(_) if !self.publisher.is_attached() && !self.supervisor.is_shutting_down() => {
                Err(ReliabilityError::ChannelUnavailable)
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl ConnectionSession for RelayServer {
    async fn run(
        &self,
        supervisor: &ConnectionSupervisor,
        connection: Arc<dyn BrokerConnection>,
    ) -> SessionEnd {
        let (mut confirms, mut deliveries) = match self.setup(supervisor).await {
            Ok(streams) => streams,
            Err(err) => return SessionEnd::Failed(err),
        };
        info!("Relay session established");

        let shutdown = supervisor.shutdown_requested();
        let closed = connection.closed();
        tokio::pin!(shutdown);
        tokio::pin!(closed);

        loop {
            tokio::select! {
                biased;

                _ = &mut shutdown => return SessionEnd::Shutdown,

                reason = &mut closed => return SessionEnd::ConnectionLost(reason),

                Some(confirmation) = confirms.recv() => {
                    self.publisher.handle_confirmation(confirmation);
                }

                delivery = deliveries.next() => match delivery {
                    Some(Ok(delivery)) => {
                        if let Err(err) = self.handle_delivery(delivery).await {
                            return SessionEnd::Failed(err);
                        }
                    }
                    Some(Err(err)) => return SessionEnd::Failed(ReliabilityError::from_broker(err)),
                    None if supervisor.is_shutting_down() => return SessionEnd::Shutdown,
                    None if !connection.is_open() => {
                        return SessionEnd::ConnectionLost(connection.closed().await)
                    }
                    None => return SessionEnd::Failed(self.consumer.mark_cancelled_remotely()),
                },
            }
        }
    }

    async fn detach(&self) {
        let unconfirmed = self.publisher.detach();
        if !unconfirmed.is_empty() {
            warn!(
                count = unconfirmed.len(),
                "Deliveries left unconfirmed by the lost session"
            );
        }
        self.consumer.detach();
    }
}
