//! # Topology Manager
//!
//! Ensures an exchange, a queue and the binding between them exist before
//! any traffic flows on a channel. The three round trips run strictly in
//! order (`exchange.declare` → `queue.declare` → `queue.bind`), each awaited
//! before the next is issued.
//!
//! The manager remembers which topologies it already ensured on which
//! channel; asking again for the same topology on the same channel issues no
//! RPC. Channel numbers restart with every connection, so the owner calls
//! [`TopologyManager::reset`] at the start of each connection session.

use crate::error::{ReliabilityError, Result, TopologyStep};
use broker::{BrokerChannel, BrokerResult};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info};
use types::Topology;

/// Result of a completed topology setup
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundQueue {
    /// Queue name as confirmed by the broker
    pub queue: String,
    pub topology: Topology,
}

#[derive(Debug, Default)]
pub struct TopologyManager {
    ensured: Mutex<HashMap<u16, HashSet<Topology>>>,
    rpc_timeout: Option<Duration>,
}

impl TopologyManager {
    pub fn new(rpc_timeout: Option<Duration>) -> Self {
        Self {
            ensured: Mutex::new(HashMap::new()),
            rpc_timeout,
        }
    }

    pub fn rpc_timeout(&self) -> Option<Duration> {
        self.rpc_timeout
    }

    /// Forget every ensured topology
    pub fn reset(&self) {
        self.ensured.lock().clear();
    }

    pub fn is_ensured(&self, channel_id: u16, topology: &Topology) -> bool {
        self.ensured
            .lock()
            .get(&channel_id)
            .map(|set| set.contains(topology))
            .unwrap_or(false)
    }

    /// Declare exchange and queue, then bind them
    pub async fn ensure(&self, channel: &dyn BrokerChannel, topology: &Topology) -> Result<BoundQueue> {
        let channel_id = channel.id();
        if self.is_ensured(channel_id, topology) {
            debug!(channel = channel_id, %topology, "Topology already ensured");
            return Ok(BoundQueue {
                queue: topology.queue.clone(),
                topology: topology.clone(),
            });
        }

        self.step(
            TopologyStep::DeclareExchange,
            topology,
            channel.exchange_declare(&topology.exchange, topology.exchange_kind, topology.durable),
        )
        .await?;

        let queue = self
            .step(
                TopologyStep::DeclareQueue,
                topology,
                channel.queue_declare(&topology.queue, topology.durable),
            )
            .await?;

        self.step(
            TopologyStep::BindQueue,
            topology,
            channel.queue_bind(&queue, &topology.exchange, &topology.routing_key),
        )
        .await?;

        self.ensured
            .lock()
            .entry(channel_id)
            .or_default()
            .insert(topology.clone());

        info!(channel = channel_id, %topology, "Topology ensured");
        Ok(BoundQueue {
            queue,
            topology: topology.clone(),
        })
    }

    async fn step<T>(
        &self,
        step: TopologyStep,
        topology: &Topology,
        rpc: impl Future<Output = BrokerResult<T>>,
    ) -> Result<T> {
        with_timeout(self.rpc_timeout, step.as_str(), rpc)
            .await?
            .map_err(|source| ReliabilityError::Topology {
                step,
                topology: topology.to_string(),
                source,
            })
    }
}

/// Await a broker round trip, bounded by the optional RPC timeout
pub(crate) async fn with_timeout<T>(
    timeout: Option<Duration>,
    operation: &'static str,
    rpc: impl Future<Output = T>,
) -> Result<T> {
    match timeout {
        Some(limit) => tokio::time::timeout(limit, rpc)
            .await
            .map_err(|_| ReliabilityError::Timeout {
                operation,
                timeout: limit,
            }),
        None => Ok(rpc.await),
    }
}
