//! # Consumer Channel
//!
//! Subscribes to the inbound queue and enforces the acknowledgement
//! discipline: every delivery tag is settled (acked or nacked) exactly once.
//!
//! ```text
//! Unbound → Bound → Consuming → Cancelled
//!    └────────┴─────────┴──────→ Closed      (channel or connection loss)
//! ```

use crate::error::{ReliabilityError, Result};
use crate::supervisor::ChannelHandle;
use crate::topology::{with_timeout, TopologyManager};
use broker::{BrokerChannel, Delivery, DeliveryStream};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use types::{InboundMessage, Topology};

/// Default consumer tag announced to the broker
pub const DEFAULT_CONSUMER_TAG: &str = "relay-consumer";

/// When a handled delivery is acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Ack after the handler succeeds, nack when it fails
    #[default]
    OnSuccess,
    /// Ack after the handler returns, whatever the outcome
    Always,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unbound,
    Bound,
    Consuming,
    Cancelled,
    Closed,
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Unbound => "unbound",
            ConsumerState::Bound => "bound",
            ConsumerState::Consuming => "consuming",
            ConsumerState::Cancelled => "cancelled",
            ConsumerState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Requeued,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerOptions {
    pub ack_mode: AckMode,
    /// Requeue deliveries whose handler failed (under `OnSuccess`)
    pub requeue_on_failure: bool,
    pub consumer_tag: String,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self {
            ack_mode: AckMode::OnSuccess,
            requeue_on_failure: true,
            consumer_tag: DEFAULT_CONSUMER_TAG.to_string(),
        }
    }
}

#[derive(Debug)]
struct ConsumerInner {
    state: ConsumerState,
    handle: Option<ChannelHandle>,
    unsettled: HashSet<u64>,
    acked: u64,
    nacked: u64,
    /// Cancelled locally; no further subscriptions
    stopped: bool,
}

#[derive(Debug)]
pub struct ConsumerChannel {
    topology: Topology,
    options: ConsumerOptions,
    inner: Mutex<ConsumerInner>,
}

impl ConsumerChannel {
    pub fn new(topology: Topology, options: ConsumerOptions) -> Self {
        Self {
            topology,
            options,
            inner: Mutex::new(ConsumerInner {
                state: ConsumerState::Unbound,
                handle: None,
                unsettled: HashSet::new(),
                acked: 0,
                nacked: 0,
                stopped: false,
            }),
        }
    }

    pub fn state(&self) -> ConsumerState {
        self.inner.lock().state
    }

    pub fn options(&self) -> &ConsumerOptions {
        &self.options
    }

    /// Deliveries received on the current channel and not yet settled
    pub fn unsettled_count(&self) -> usize {
        self.inner.lock().unsettled.len()
    }

    /// Total (acked, nacked) settlements sent to the broker
    pub fn settled_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.acked, inner.nacked)
    }

    fn set_state(&self, next: ConsumerState) {
        let mut inner = self.inner.lock();
        if inner.state != next {
            debug!(from = %inner.state, to = %next, "Consumer state changed");
            inner.state = next;
        }
    }

    /// Ensure the inbound topology on `handle` and subscribe to its queue
    pub async fn attach(
        &self,
        handle: ChannelHandle,
        topology: &TopologyManager,
    ) -> Result<DeliveryStream> {
        let channel = handle.upgrade().ok_or(ReliabilityError::ChannelUnavailable)?;
        {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return Err(ReliabilityError::ChannelUnavailable);
            }
            inner.unsettled.clear();
            inner.handle = Some(handle);
            inner.state = ConsumerState::Unbound;
        }

        let bound = topology.ensure(channel.as_ref(), &self.topology).await?;
        self.set_state(ConsumerState::Bound);

        let deliveries = with_timeout(
            topology.rpc_timeout(),
            "basic.consume",
            channel.basic_consume(&bound.queue, &self.options.consumer_tag),
        )
        .await?
        .map_err(ReliabilityError::from_broker)?;

        let consuming = {
            let mut inner = self.inner.lock();
            if !inner.stopped {
                inner.state = ConsumerState::Consuming;
            }
            !inner.stopped
        };
        if !consuming {
            // Cancelled while the subscription was in flight
            if let Err(err) = channel.basic_cancel(&self.options.consumer_tag).await {
                debug!(error = %err, "basic.cancel failed");
            }
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing consumer channel");
            }
            return Err(ReliabilityError::ChannelUnavailable);
        }
        info!(
            channel = channel.id(),
            queue = %bound.queue,
            consumer_tag = %self.options.consumer_tag,
            "Consuming"
        );
        Ok(deliveries)
    }

    /// Take ownership of a delivery: remember its tag as unsettled and
    /// decode its body
    pub fn accept(&self, delivery: &Delivery) -> Result<InboundMessage> {
        self.inner.lock().unsettled.insert(delivery.delivery_tag);

        let message = InboundMessage::decode(
            delivery.delivery_tag,
            delivery.redelivered,
            &delivery.body,
        )?;

        if tracing::enabled!(tracing::Level::DEBUG) {
            let pretty = serde_json::to_string_pretty(&message.payload).unwrap_or_default();
            debug!(
                delivery_tag = message.delivery_tag,
                redelivered = message.redelivered,
                "Received message:\n{}",
                pretty
            );
        }
        Ok(message)
    }

    /// Mark a tag settled locally, failing if it was settled already
    fn settle_locally(&self, delivery_tag: u64) -> Result<Arc<dyn BrokerChannel>> {
        let mut inner = self.inner.lock();
        if !inner.unsettled.remove(&delivery_tag) {
            warn!(delivery_tag, "Delivery already settled, not acknowledging again");
            return Err(ReliabilityError::AlreadySettled(delivery_tag));
        }
        // Without a channel the broker redelivers the message after reconnect
        inner
            .handle
            .as_ref()
            .and_then(ChannelHandle::upgrade)
            .ok_or(ReliabilityError::ChannelUnavailable)
    }

    /// Acknowledge one delivery. A second call for the same tag is rejected
    /// and nothing is sent.
    pub async fn acknowledge(&self, delivery_tag: u64) -> Result<()> {
        let channel = self.settle_locally(delivery_tag)?;
        channel
            .basic_ack(delivery_tag)
            .await
            .map_err(ReliabilityError::from_broker)?;
        self.inner.lock().acked += 1;
        debug!(delivery_tag, "Delivery acknowledged");
        Ok(())
    }

    /// Negatively acknowledge one delivery
    pub async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        let channel = self.settle_locally(delivery_tag)?;
        channel
            .basic_nack(delivery_tag, requeue)
            .await
            .map_err(ReliabilityError::from_broker)?;
        self.inner.lock().nacked += 1;
        debug!(delivery_tag, requeue, "Delivery rejected");
        Ok(())
    }

    /// Settle a delivery according to the ack mode and the handler outcome
    pub async fn settle(&self, delivery_tag: u64, outcome: &Result<()>) -> Result<Settlement> {
        match (self.options.ack_mode, outcome) {
            (AckMode::Always, _) | (AckMode::OnSuccess, Ok(())) => {
                self.acknowledge(delivery_tag).await?;
                Ok(Settlement::Acked)
            }
            (AckMode::OnSuccess, Err(err)) => {
                let requeue = self.options.requeue_on_failure && err.should_requeue();
                self.reject(delivery_tag, requeue).await?;
                Ok(if requeue {
                    Settlement::Requeued
                } else {
                    Settlement::Rejected
                })
            }
        }
    }

    /// Stop consuming and close the channel. Unsettled deliveries go back to
    /// the broker. Idempotent.
    pub async fn cancel(&self) -> Result<()> {
        let handle = {
            let mut inner = self.inner.lock();
            if inner.stopped {
                return Ok(());
            }
            inner.stopped = true;
            inner.state = ConsumerState::Cancelled;
            let released = inner.unsettled.len();
            inner.unsettled.clear();
            if released > 0 {
                debug!(released, "Unsettled deliveries released on cancel");
            }
            inner.handle.take()
        };

        if let Some(channel) = handle.as_ref().and_then(ChannelHandle::upgrade) {
            if let Err(err) = channel.basic_cancel(&self.options.consumer_tag).await {
                debug!(error = %err, "basic.cancel failed");
            }
            if let Err(err) = channel.close().await {
                debug!(error = %err, "Error closing consumer channel");
            }
        }
        info!(consumer_tag = %self.options.consumer_tag, "Consumer cancelled");
        Ok(())
    }

    /// The broker ended the delivery stream while the channel stayed open
    pub fn mark_cancelled_remotely(&self) -> ReliabilityError {
        warn!(consumer_tag = %self.options.consumer_tag, "Consumer cancelled by the broker");
        self.set_state(ConsumerState::Cancelled);
        ReliabilityError::ConsumerCancelled(self.options.consumer_tag.clone())
    }

    /// Forget the channel after connection loss
    pub fn detach(&self) {
        let mut inner = self.inner.lock();
        inner.handle = None;
        inner.unsettled.clear();
        inner.state = ConsumerState::Closed;
    }
}
