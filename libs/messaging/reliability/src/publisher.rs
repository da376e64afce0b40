//! # Publisher Channel
//!
//! Sends envelopes on a confirm-mode channel and reconciles broker
//! confirmations against the deliveries still in flight.
//!
//! Every publish wraps the payload in a fresh [`Envelope`], registers a
//! pending [`DeliveryRecord`] under the next sequence number, then transmits.
//! Registration and transmission happen under one send lock so the local
//! numbering always matches the broker's confirm numbering.
//!
//! A new tracker starts with every attached channel; whatever is still
//! pending when the channel goes away is reported, never dropped silently.

use crate::error::{ReliabilityError, Result};
use crate::supervisor::ChannelHandle;
use crate::topology::TopologyManager;
use crate::tracker::DeliveryTracker;
use broker::{ConfirmationStream, PublishProperties};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tracing::{debug, info, warn};
use types::{Confirmation, DeliveryRecord, DeliveryState, Envelope, Topology};

/// Default `app_id` property of published messages
pub const DEFAULT_APP_ID: &str = "relay-publisher";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherOptions {
    pub app_id: String,
    /// Publish with delivery mode 2
    pub persistent: bool,
}

impl Default for PublisherOptions {
    fn default() -> Self {
        Self {
            app_id: DEFAULT_APP_ID.to_string(),
            persistent: true,
        }
    }
}

/// Publish counters; `pending` is the current in-flight count, the others
/// accumulate across channel sessions
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PublisherStats {
    pub published: u64,
    pub pending: u64,
    pub acked: u64,
    pub nacked: u64,
}

impl fmt::Display for PublisherStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "published {}, {} awaiting confirmation, {} acked, {} nacked",
            self.published, self.pending, self.acked, self.nacked
        )
    }
}

#[derive(Debug, Default)]
struct PublisherInner {
    handle: Option<ChannelHandle>,
    tracker: DeliveryTracker,
    stats: PublisherStats,
    closed: bool,
}

impl PublisherInner {
    fn snapshot(&self) -> PublisherStats {
        PublisherStats {
            pending: self.tracker.pending_count() as u64,
            ..self.stats
        }
    }
}

#[derive(Debug)]
pub struct PublisherChannel {
    topology: Topology,
    options: PublisherOptions,
    inner: Mutex<PublisherInner>,
    send_lock: tokio::sync::Mutex<()>,
}

impl PublisherChannel {
    pub fn new(topology: Topology, options: PublisherOptions) -> Self {
        Self {
            topology,
            options,
            inner: Mutex::new(PublisherInner::default()),
            send_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Ensure the outbound topology on `handle`, enable confirms and start a
    /// fresh delivery session. The returned stream carries the confirmations
    /// to feed into [`PublisherChannel::handle_confirmation`].
    pub async fn attach(
        &self,
        handle: ChannelHandle,
        topology: &TopologyManager,
    ) -> Result<ConfirmationStream> {
        if self.inner.lock().closed {
            return Err(ReliabilityError::ChannelUnavailable);
        }
        let channel = handle.upgrade().ok_or(ReliabilityError::ChannelUnavailable)?;

        topology.ensure(channel.as_ref(), &self.topology).await?;
        let confirms = channel
            .confirm_select()
            .await
            .map_err(ReliabilityError::from_broker)?;

        let attached = {
            let mut inner = self.inner.lock();
            if inner.closed {
                false
            } else {
                let leftover = inner.tracker.drain_unconfirmed();
                if !leftover.is_empty() {
                    warn!(
                        count = leftover.len(),
                        "Deliveries from the previous channel were never confirmed"
                    );
                }
                inner.tracker = DeliveryTracker::new();
                inner.handle = Some(handle);
                true
            }
        };
        if !attached {
            // Closed while the setup round trips were in flight
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing publisher channel");
            }
            return Err(ReliabilityError::ChannelUnavailable);
        }
        info!(channel = channel.id(), topology = %self.topology, "Publisher channel ready");
        Ok(confirms)
    }

    pub fn is_attached(&self) -> bool {
        self.inner
            .lock()
            .handle
            .as_ref()
            .map(ChannelHandle::is_valid)
            .unwrap_or(false)
    }

    /// Wrap `payload` in an envelope and send it to the outbound exchange.
    ///
    /// Returns the sequence number under which the delivery is tracked.
    pub async fn publish(&self, payload: Value) -> Result<u64> {
        let envelope = Envelope::new(payload);
        let body = envelope.to_wire()?;

        let _send = self.send_lock.lock().await;
        let (channel, sequence) = {
            let mut inner = self.inner.lock();
            if inner.closed {
                return Err(ReliabilityError::ChannelUnavailable);
            }
            let channel = inner
                .handle
                .as_ref()
                .and_then(ChannelHandle::upgrade)
                .ok_or(ReliabilityError::ChannelUnavailable)?;
            let sequence = inner.tracker.register(envelope.id());
            (channel, sequence)
        };

        let properties = PublishProperties {
            persistent: self.options.persistent,
            ..PublishProperties::json(self.options.app_id.clone())
        }
        .with_message_id(envelope.id().to_string());

        let sent = channel
            .basic_publish(
                &self.topology.exchange,
                &self.topology.routing_key,
                &body,
                &properties,
            )
            .await;

        if let Err(err) = sent {
            // The broker's confirm numbering no longer matches the tracker:
            // the channel must not carry further publishes
            {
                let mut inner = self.inner.lock();
                inner.tracker.abandon(sequence);
                inner.handle = None;
            }
            warn!(sequence, error = %err, "Publish failed, publisher channel abandoned");
            if channel.is_open() {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Error closing publisher channel");
                }
            }
            return Err(ReliabilityError::from_broker(err));
        }
        self.inner.lock().stats.published += 1;

        debug!(sequence, envelope_id = %envelope.id(), "Envelope published");
        Ok(sequence)
    }

    /// Resolve pending deliveries covered by a broker ack or nack
    pub fn handle_confirmation(&self, confirmation: Confirmation) -> Vec<DeliveryRecord> {
        let mut inner = self.inner.lock();
        let resolved = inner.tracker.resolve(confirmation);

        for record in &resolved {
            match record.state {
                DeliveryState::Acked => inner.stats.acked += 1,
                DeliveryState::Nacked => {
                    inner.stats.nacked += 1;
                    warn!(
                        sequence = record.sequence,
                        envelope_id = %record.envelope_id,
                        "Broker rejected delivery"
                    );
                }
                DeliveryState::Pending => {}
            }
        }

        info!("{}", inner.snapshot());
        resolved
    }

    pub fn stats(&self) -> PublisherStats {
        self.inner.lock().snapshot()
    }

    /// Forget the channel after connection loss, returning the deliveries
    /// that were never confirmed
    pub fn detach(&self) -> Vec<DeliveryRecord> {
        let mut inner = self.inner.lock();
        inner.handle = None;
        let unconfirmed = inner.tracker.drain_unconfirmed();
        if !unconfirmed.is_empty() {
            warn!(
                count = unconfirmed.len(),
                "Channel lost with deliveries awaiting confirmation"
            );
        }
        unconfirmed
    }

    /// Close the channel. Deliveries still pending are reported as
    /// [`ReliabilityError::DeliveryUnconfirmed`]; the close itself succeeds.
    pub async fn close(&self) -> Result<()> {
        let _send = self.send_lock.lock().await;
        let (handle, unconfirmed) = {
            let mut inner = self.inner.lock();
            inner.closed = true;
            (inner.handle.take(), inner.tracker.drain_unconfirmed())
        };

        if let Some(channel) = handle.as_ref().and_then(ChannelHandle::upgrade) {
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing publisher channel");
            }
        }

        if unconfirmed.is_empty() {
            info!("Publisher channel closed");
            Ok(())
        } else {
            warn!(count = unconfirmed.len(), "Publisher closed with unconfirmed deliveries");
            Err(ReliabilityError::DeliveryUnconfirmed {
                records: unconfirmed,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::ConnectionSupervisor;
    use crate::ReconnectPolicy;
    use broker::{BrokerOp, ConfirmBehavior, MemoryBroker};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_test::assert_ok;
    use types::CloseReason;

    async fn attached(broker: &MemoryBroker) -> (ConnectionSupervisor, PublisherChannel, ConfirmationStream) {
        let supervisor = ConnectionSupervisor::new(
            Arc::new(broker.clone()),
            "memory://",
            ReconnectPolicy::default(),
        );
        supervisor.connect().await.unwrap();
        let handle = supervisor.open_channel().await.unwrap();
        let publisher = PublisherChannel::new(Topology::core_to_sender(), PublisherOptions::default());
        let confirms = publisher
            .attach(handle, &TopologyManager::default())
            .await
            .unwrap();
        (supervisor, publisher, confirms)
    }

    #[tokio::test]
    async fn test_publish_then_ack_clears_pending() {
        let broker = MemoryBroker::new();
        let (_supervisor, publisher, mut confirms) = attached(&broker).await;

        let sequence = publisher.publish(json!({"_id": "E1"})).await.unwrap();
        assert_eq!(sequence, 1);

        let confirmation = confirms.recv().await.unwrap();
        let resolved = publisher.handle_confirmation(confirmation);

        assert_eq!(resolved.len(), 1);
        let stats = publisher.stats();
        assert_eq!(stats.pending, 0);
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.nacked, 0);
        assert_eq!(
            stats.to_string(),
            "published 1, 0 awaiting confirmation, 1 acked, 0 nacked"
        );
    }

    #[tokio::test]
    async fn test_outbound_wire_form_and_order() {
        let broker = MemoryBroker::new();
        let (_supervisor, publisher, _confirms) = attached(&broker).await;

        publisher.publish(json!({"n": 1})).await.unwrap();

        let queued = broker.queued_messages(&Topology::core_to_sender().queue);
        let wire: Value = serde_json::from_slice(&queued[0]).unwrap();
        assert_eq!(wire["data"], json!({"n": 1}));
        assert!(wire["_id"].is_string());

        let ops = broker.ops();
        let confirm_at = ops
            .iter()
            .position(|op| matches!(op, BrokerOp::ConfirmSelect { .. }))
            .unwrap();
        let bind_at = ops
            .iter()
            .position(|op| matches!(op, BrokerOp::QueueBind { .. }))
            .unwrap();
        let publish_at = ops
            .iter()
            .position(|op| matches!(op, BrokerOp::Publish { .. }))
            .unwrap();
        assert!(bind_at < confirm_at && confirm_at < publish_at);
    }

    #[tokio::test]
    async fn test_nack_counts_and_multiple_ack() {
        let broker = MemoryBroker::new();
        let (_supervisor, publisher, mut confirms) = attached(&broker).await;

        broker.set_confirm_behavior(ConfirmBehavior::Nack);
        publisher.publish(json!(1)).await.unwrap();
        publisher.handle_confirmation(confirms.recv().await.unwrap());

        broker.set_confirm_behavior(ConfirmBehavior::Hold);
        for n in 0..3 {
            publisher.publish(json!(n)).await.unwrap();
        }
        assert_eq!(publisher.stats().pending, 3);

        broker.release_held_confirms(true);
        let resolved = publisher.handle_confirmation(confirms.recv().await.unwrap());

        assert_eq!(resolved.len(), 3);
        assert_eq!(
            publisher.stats(),
            PublisherStats {
                published: 4,
                pending: 0,
                acked: 3,
                nacked: 1,
            }
        );
    }

    #[tokio::test]
    async fn test_close_reports_unconfirmed() {
        let broker = MemoryBroker::new();
        broker.set_confirm_behavior(ConfirmBehavior::Hold);
        let (_supervisor, publisher, _confirms) = attached(&broker).await;

        publisher.publish(json!({"late": true})).await.unwrap();

        match publisher.close().await {
            Err(ReliabilityError::DeliveryUnconfirmed { records }) => {
                assert_eq!(records.len(), 1);
                assert_eq!(records[0].sequence, 1);
            }
            other => panic!("expected unconfirmed report, got {other:?}"),
        }
        assert!(matches!(
            publisher.publish(json!({})).await,
            Err(ReliabilityError::ChannelUnavailable)
        ));
    }

    #[tokio::test]
    async fn test_clean_close_and_lost_channel() {
        let broker = MemoryBroker::new();
        let (supervisor, publisher, mut confirms) = attached(&broker).await;

        publisher.publish(json!({})).await.unwrap();
        publisher.handle_confirmation(confirms.recv().await.unwrap());

        supervisor.handle_close(CloseReason::connection_lost("reset"));
        assert!(!publisher.is_attached());
        assert!(matches!(
            publisher.publish(json!({})).await,
            Err(ReliabilityError::ChannelUnavailable)
        ));
        assert!(publisher.detach().is_empty());
        assert_ok!(publisher.close().await);
    }

    #[tokio::test]
    async fn test_failed_publish_abandons_channel() {
        let broker = MemoryBroker::new();
        let (supervisor, publisher, _confirms) = attached(&broker).await;

        broker.fail_next_publishes(1);
        let err = publisher.publish(json!({"_id": "lost"})).await.unwrap_err();
        assert!(matches!(err, ReliabilityError::Broker(_)));
        assert!(!publisher.is_attached());
        assert_eq!(publisher.stats(), PublisherStats::default());
        assert!(broker
            .ops()
            .iter()
            .any(|op| matches!(op, BrokerOp::CloseChannel { .. })));

        // A fresh channel starts numbering again from 1
        let handle = supervisor.open_channel().await.unwrap();
        let mut confirms = publisher
            .attach(handle, &TopologyManager::default())
            .await
            .unwrap();
        assert_eq!(publisher.publish(json!({"_id": "kept"})).await.unwrap(), 1);
        let resolved = publisher.handle_confirmation(confirms.recv().await.unwrap());
        assert_eq!(resolved.len(), 1);
        assert_eq!(publisher.stats().acked, 1);
    }

    #[tokio::test]
    async fn test_attach_after_close_is_refused() {
        let broker = MemoryBroker::new();
        let (supervisor, publisher, _confirms) = attached(&broker).await;
        assert_ok!(publisher.close().await);

        let handle = supervisor.open_channel().await.unwrap();
        assert!(matches!(
            publisher.attach(handle, &TopologyManager::default()).await,
            Err(ReliabilityError::ChannelUnavailable)
        ));
        assert!(!publisher.is_attached());
        assert_eq!(
            broker
                .ops()
                .iter()
                .filter(|op| matches!(op, BrokerOp::ConfirmSelect { .. }))
                .count(),
            1
        );
    }
}
