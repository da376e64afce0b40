//! # In-Memory Broker
//!
//! An in-process broker implementing the [`Connector`] family of traits with
//! enough AMQP semantics to exercise the reliability core end to end:
//!
//! - direct/fanout/topic routing through declared exchanges and bindings
//! - per-channel delivery tags, unacked tracking, ack/nack with requeue
//! - publisher confirms, with ack, nack or held-then-released behavior
//! - channel-level errors that close the channel (inequivalent re-declare,
//!   unknown delivery tag, missing exchange)
//! - unacked deliveries requeued with `redelivered = true` on channel loss
//!
//! Test hooks let callers drop every connection, refuse connection attempts,
//! fail publishes, stall exchange declares, cancel consumers from the broker
//! side and inspect queues and the log of client operations ([`BrokerOp`]).

use crate::{
    BrokerChannel, BrokerConnection, BrokerError, BrokerResult, ConfirmationStream, Connector,
    Delivery, DeliveryStream, PublishProperties,
};
use async_trait::async_trait;
use futures::channel::mpsc as stream_mpsc;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::debug;
use types::{CloseReason, Confirmation, ExchangeKind};

/// How the broker answers publishes on channels in confirm mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    /// Route the message and ack it immediately
    #[default]
    Ack,
    /// Drop the message and nack it
    Nack,
    /// Route the message but hold the ack until [`MemoryBroker::release_held_confirms`]
    Hold,
}

/// Identifies a channel across all connections of the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelRef {
    pub connection: u64,
    pub channel: u16,
}

/// Client operation as received by the broker, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerOp {
    Connect { connection: u64 },
    OpenChannel { at: ChannelRef },
    ExchangeDeclare { at: ChannelRef, exchange: String },
    QueueDeclare { at: ChannelRef, queue: String },
    QueueBind { at: ChannelRef, queue: String, exchange: String, routing_key: String },
    ConfirmSelect { at: ChannelRef },
    Publish { at: ChannelRef, exchange: String, routing_key: String },
    Consume { at: ChannelRef, queue: String, consumer_tag: String },
    Ack { at: ChannelRef, delivery_tag: u64 },
    Nack { at: ChannelRef, delivery_tag: u64, requeue: bool },
    Cancel { at: ChannelRef, consumer_tag: String },
    CloseChannel { at: ChannelRef },
    CloseConnection { connection: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ExchangeSpec {
    kind: ExchangeKind,
    durable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Binding {
    exchange: String,
    queue: String,
    routing_key: String,
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    #[allow(dead_code)]
    properties: PublishProperties,
    redelivered: bool,
}

#[derive(Debug)]
struct ConsumerEntry {
    at: ChannelRef,
    tag: String,
    sender: stream_mpsc::UnboundedSender<Result<Delivery, BrokerError>>,
}

#[derive(Debug, Default)]
struct QueueState {
    durable: bool,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerEntry>,
    cursor: usize,
}

#[derive(Debug)]
struct ConnectionEntry {
    open: bool,
    next_channel: u16,
    close_tx: watch::Sender<Option<CloseReason>>,
}

#[derive(Debug, Default)]
struct ChannelEntry {
    open: bool,
    next_delivery_tag: u64,
    unacked: BTreeMap<u64, (String, StoredMessage)>,
    confirms: Option<mpsc::UnboundedSender<Confirmation>>,
    publish_seq: u64,
    next_consumer_tag: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<ChannelRef, ChannelEntry>,
    next_connection: u64,
    next_generated_queue: u64,
    ops: Vec<BrokerOp>,
    connect_times: Vec<Instant>,
    refuse_connects: usize,
    fail_publishes: usize,
    confirm_behavior: ConfirmBehavior,
    held_confirms: Vec<(ChannelRef, u64)>,
}

impl BrokerState {
    fn ensure_channel_open(&self, at: ChannelRef) -> BrokerResult<()> {
        let connection_open = self
            .connections
            .get(&at.connection)
            .map(|c| c.open)
            .unwrap_or(false);
        if !connection_open {
            return Err(BrokerError::ConnectionClosed(CloseReason::connection_lost(
                "connection is closed",
            )));
        }

        match self.channels.get(&at) {
            Some(entry) if entry.open => Ok(()),
            _ => Err(BrokerError::ChannelClosed {
                channel: at.channel,
                reason: CloseReason::new(504, "CHANNEL_ERROR - channel is closed"),
            }),
        }
    }

    /// Close a channel: requeue its unacked deliveries and drop its consumers
    fn close_channel(&mut self, at: ChannelRef) {
        let Some(entry) = self.channels.get_mut(&at) else {
            return;
        };
        if !entry.open {
            return;
        }
        entry.open = false;
        entry.confirms = None;
        let unacked = std::mem::take(&mut entry.unacked);

        for queue in self.queues.values_mut() {
            queue.consumers.retain(|c| c.at != at);
        }

        // Requeue in reverse tag order so the oldest ends up first
        for (_, (queue_name, mut message)) in unacked.into_iter().rev() {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }

        self.held_confirms.retain(|(held_at, _)| *held_at != at);
        self.dispatch_all();
    }

    fn close_connection(&mut self, connection: u64, reason: CloseReason) {
        let channels: Vec<ChannelRef> = self
            .channels
            .keys()
            .filter(|at| at.connection == connection)
            .copied()
            .collect();
        for at in channels {
            self.close_channel(at);
        }

        if let Some(entry) = self.connections.get_mut(&connection) {
            if entry.open {
                entry.open = false;
                let _ = entry.close_tx.send(Some(reason));
            }
        }
    }

    fn route(&self, exchange: &str, routing_key: &str) -> Vec<String> {
        let Some(spec) = self.exchanges.get(exchange) else {
            return Vec::new();
        };

        let mut queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange)
            .filter(|b| match spec.kind {
                ExchangeKind::Direct => b.routing_key == routing_key,
                ExchangeKind::Fanout | ExchangeKind::Headers => true,
                ExchangeKind::Topic => topic_matches(&b.routing_key, routing_key),
            })
            .map(|b| b.queue.clone())
            .collect();
        queues.dedup();
        queues
    }

    fn enqueue(&mut self, exchange: &str, routing_key: &str, body: &[u8], properties: &PublishProperties) {
        for queue_name in self.route(exchange, routing_key) {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.ready.push_back(StoredMessage {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    body: body.to_vec(),
                    properties: properties.clone(),
                    redelivered: false,
                });
            }
            self.dispatch(&queue_name);
        }
    }

    fn dispatch_all(&mut self) {
        let names: Vec<String> = self.queues.keys().cloned().collect();
        for name in names {
            self.dispatch(&name);
        }
    }

    /// Push ready messages of a queue to its consumers, round robin
    fn dispatch(&mut self, queue_name: &str) {
        let BrokerState {
            queues, channels, ..
        } = self;
        let Some(queue) = queues.get_mut(queue_name) else {
            return;
        };

        loop {
            queue.consumers.retain(|c| !c.sender.is_closed());
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let index = queue.cursor % queue.consumers.len();
            queue.cursor = queue.cursor.wrapping_add(1);
            let consumer = &queue.consumers[index];

            let Some(channel) = channels.get_mut(&consumer.at).filter(|c| c.open) else {
                queue.consumers.remove(index);
                continue;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };

            channel.next_delivery_tag += 1;
            let delivery_tag = channel.next_delivery_tag;
            let delivery = Delivery {
                delivery_tag,
                redelivered: message.redelivered,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                body: message.body.clone(),
            };
            channel
                .unacked
                .insert(delivery_tag, (queue_name.to_string(), message));

            if consumer.sender.unbounded_send(Ok(delivery)).is_err() {
                // Receiver vanished between the check and the send
                if let Some((_, (_, message))) = channel.unacked.remove_entry(&delivery_tag) {
                    queue.ready.push_front(message);
                }
                queue.consumers.remove(index);
            }
        }
    }
}

/// Match an AMQP topic binding pattern (`*` = one word, `#` = zero or more)
fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.first(), key.first()) {
            (None, None) => true,
            (Some(&"#"), _) => {
                matches(&pattern[1..], key) || (!key.is_empty() && matches(pattern, &key[1..]))
            }
            (Some(&"*"), Some(_)) => matches(&pattern[1..], &key[1..]),
            (Some(p), Some(k)) if p == k => matches(&pattern[1..], &key[1..]),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// In-process broker shared by every connection it hands out
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    declares_stalled: Arc<watch::Sender<bool>>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        let (declares_stalled, _) = watch::channel(false);
        Self {
            state: Arc::default(),
            declares_stalled: Arc::new(declares_stalled),
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure how publishes on confirm-mode channels are answered
    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        self.state.lock().confirm_behavior = behavior;
    }

    /// Send the acks held under [`ConfirmBehavior::Hold`].
    ///
    /// With `multiple`, each channel receives a single ack carrying the
    /// multiple flag for its highest held sequence. Returns the number of
    /// confirms sent.
    pub fn release_held_confirms(&self, multiple: bool) -> usize {
        let mut state = self.state.lock();
        let held = std::mem::take(&mut state.held_confirms);

        let mut per_channel: BTreeMap<ChannelRef, Vec<u64>> = BTreeMap::new();
        for (at, sequence) in held {
            per_channel.entry(at).or_default().push(sequence);
        }

        let mut sent = 0;
        for (at, sequences) in per_channel {
            let Some(sender) = state.channels.get(&at).and_then(|c| c.confirms.clone()) else {
                continue;
            };
            if multiple {
                if let Some(highest) = sequences.iter().max() {
                    if sender.send(Confirmation::ack(*highest).multiple()).is_ok() {
                        sent += 1;
                    }
                }
            } else {
                for sequence in sequences {
                    if sender.send(Confirmation::ack(sequence)).is_ok() {
                        sent += 1;
                    }
                }
            }
        }
        sent
    }

    /// Fail the next `count` connection attempts
    pub fn refuse_next_connects(&self, count: usize) {
        self.state.lock().refuse_connects = count;
    }

    /// Reject the next `count` publishes with a protocol error. The channel
    /// stays open and its confirm sequence does not advance.
    pub fn fail_next_publishes(&self, count: usize) {
        self.state.lock().fail_publishes = count;
    }

    /// Hold every `exchange.declare` until [`MemoryBroker::release_declares`]
    pub fn stall_declares(&self) {
        self.declares_stalled.send_replace(true);
    }

    pub fn release_declares(&self) {
        self.declares_stalled.send_replace(false);
    }

    async fn declare_gate(&self) {
        let mut stalled = self.declares_stalled.subscribe();
        loop {
            let held = *stalled.borrow_and_update();
            if !held || stalled.changed().await.is_err() {
                return;
            }
        }
    }

    /// Simulate a network failure: every open connection closes with `reason`
    pub fn drop_connections(&self, reason: CloseReason) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, c)| c.open)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            debug!(connection = id, %reason, "Dropping in-memory connection");
            state.close_connection(id, reason.clone());
        }
    }

    /// Cancel every consumer of a queue from the broker side
    pub fn cancel_consumers(&self, queue: &str) -> usize {
        let mut state = self.state.lock();
        match state.queues.get_mut(queue) {
            Some(q) => {
                let count = q.consumers.len();
                q.consumers.clear();
                count
            }
            None => 0,
        }
    }

    /// Declare an exchange out of band, as another client would
    pub fn declare_exchange(&self, exchange: &str, kind: ExchangeKind, durable: bool) {
        self.state
            .lock()
            .exchanges
            .insert(exchange.to_string(), ExchangeSpec { kind, durable });
    }

    /// Publish as an external producer
    pub fn publish(&self, exchange: &str, routing_key: &str, body: impl AsRef<[u8]>) -> BrokerResult<()> {
        let mut state = self.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(BrokerError::not_found(format!("no exchange '{}'", exchange)));
        }
        state.enqueue(exchange, routing_key, body.as_ref(), &PublishProperties::default());
        Ok(())
    }

    /// Bodies of the messages ready in a queue, oldest first
    pub fn queued_messages(&self, queue: &str) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.iter().map(|m| m.body.clone()).collect())
            .unwrap_or_default()
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Deliveries from `queue` that are waiting for an ack
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .channels
            .values()
            .flat_map(|c| c.unacked.values())
            .filter(|(q, _)| q == queue)
            .count()
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state
            .lock()
            .queues
            .get(queue)
            .map(|q| q.consumers.len())
            .unwrap_or(0)
    }

    pub fn has_exchange(&self, exchange: &str) -> bool {
        self.state.lock().exchanges.contains_key(exchange)
    }

    pub fn has_binding(&self, exchange: &str, queue: &str, routing_key: &str) -> bool {
        self.state.lock().bindings.iter().any(|b| {
            b.exchange == exchange && b.queue == queue && b.routing_key == routing_key
        })
    }

    pub fn open_connections(&self) -> usize {
        self.state
            .lock()
            .connections
            .values()
            .filter(|c| c.open)
            .count()
    }

    /// Every client operation received so far
    pub fn ops(&self) -> Vec<BrokerOp> {
        self.state.lock().ops.clone()
    }

    /// Instants of every connection attempt, refused ones included
    pub fn connect_times(&self) -> Vec<Instant> {
        self.state.lock().connect_times.clone()
    }
}

#[async_trait]
impl Connector for MemoryBroker {
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        state.connect_times.push(Instant::now());

        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(BrokerError::connection_failed(format!(
                "connection refused: {}",
                url
            )));
        }

        state.next_connection += 1;
        let id = state.next_connection;
        let (close_tx, close_rx) = watch::channel(None);
        state.connections.insert(
            id,
            ConnectionEntry {
                open: true,
                next_channel: 0,
                close_tx,
            },
        );
        state.ops.push(BrokerOp::Connect { connection: id });

        Ok(Arc::new(MemoryConnection {
            broker: self.clone(),
            id,
            close_rx,
        }))
    }
}

#[derive(Debug)]
pub struct MemoryConnection {
    broker: MemoryBroker,
    id: u64,
    close_rx: watch::Receiver<Option<CloseReason>>,
}

impl MemoryConnection {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>> {
        let mut state = self.broker.state.lock();
        let entry = state
            .connections
            .get_mut(&self.id)
            .filter(|c| c.open)
            .ok_or_else(|| {
                BrokerError::ConnectionClosed(CloseReason::connection_lost("connection is closed"))
            })?;

        entry.next_channel += 1;
        let at = ChannelRef {
            connection: self.id,
            channel: entry.next_channel,
        };
        state.channels.insert(
            at,
            ChannelEntry {
                open: true,
                ..Default::default()
            },
        );
        state.ops.push(BrokerOp::OpenChannel { at });

        Ok(Arc::new(MemoryChannel {
            broker: self.broker.clone(),
            at,
        }))
    }

    fn is_open(&self) -> bool {
        self.close_rx.borrow().is_none()
    }

    async fn closed(&self) -> CloseReason {
        let mut rx = self.close_rx.clone();
        loop {
            let current = rx.borrow_and_update().clone();
            if let Some(reason) = current {
                return reason;
            }
            if rx.changed().await.is_err() {
                return CloseReason::connection_lost("broker dropped");
            }
        }
    }

    async fn close(&self, reason: CloseReason) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ops.push(BrokerOp::CloseConnection {
            connection: self.id,
        });
        state.close_connection(self.id, reason);
        Ok(())
    }
}

#[derive(Debug)]
pub struct MemoryChannel {
    broker: MemoryBroker,
    at: ChannelRef,
}

impl MemoryChannel {
    /// Fail with a channel error, closing the channel like a real broker does
    fn channel_error(&self, state: &mut BrokerState, error: BrokerError) -> BrokerError {
        debug!(channel = self.at.channel, %error, "In-memory channel error");
        state.close_channel(self.at);
        error
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    fn id(&self) -> u16 {
        self.at.channel
    }

    fn is_open(&self) -> bool {
        self.broker.state.lock().ensure_channel_open(self.at).is_ok()
    }

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()> {
        self.broker.declare_gate().await;
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::ExchangeDeclare {
            at: self.at,
            exchange: exchange.to_string(),
        });

        let requested = ExchangeSpec { kind, durable };
        match state.exchanges.get(exchange) {
            Some(existing) if *existing != requested => {
                let error = BrokerError::precondition_failed(format!(
                    "inequivalent arg for exchange '{}': declared {:?}, requested {:?}",
                    exchange, existing, requested
                ));
                Err(self.channel_error(&mut state, error))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.to_string(), requested);
                Ok(())
            }
        }
    }

    async fn queue_declare(&self, queue: &str, durable: bool) -> BrokerResult<String> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::QueueDeclare {
            at: self.at,
            queue: queue.to_string(),
        });

        let name = if queue.is_empty() {
            state.next_generated_queue += 1;
            format!("amq.gen-{}", state.next_generated_queue)
        } else {
            queue.to_string()
        };

        match state.queues.get(&name) {
            Some(existing) if existing.durable != durable => {
                let error = BrokerError::precondition_failed(format!(
                    "inequivalent arg 'durable' for queue '{}'",
                    name
                ));
                Err(self.channel_error(&mut state, error))
            }
            Some(_) => Ok(name),
            None => {
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        durable,
                        ..Default::default()
                    },
                );
                Ok(name)
            }
        }
    }

    async fn queue_bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::QueueBind {
            at: self.at,
            queue: queue.to_string(),
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if !state.exchanges.contains_key(exchange) {
            let error = BrokerError::not_found(format!("no exchange '{}'", exchange));
            return Err(self.channel_error(&mut state, error));
        }
        if !state.queues.contains_key(queue) {
            let error = BrokerError::not_found(format!("no queue '{}'", queue));
            return Err(self.channel_error(&mut state, error));
        }

        let binding = Binding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };
        if !state.bindings.contains(&binding) {
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn confirm_select(&self) -> BrokerResult<ConfirmationStream> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::ConfirmSelect { at: self.at });

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(channel) = state.channels.get_mut(&self.at) {
            channel.confirms = Some(tx);
        }
        Ok(rx)
    }

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::Publish {
            at: self.at,
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
        });

        if state.fail_publishes > 0 {
            state.fail_publishes -= 1;
            return Err(BrokerError::Protocol(format!(
                "publish to '{}' rejected",
                exchange
            )));
        }

        if !state.exchanges.contains_key(exchange) {
            let error = BrokerError::not_found(format!("no exchange '{}'", exchange));
            return Err(self.channel_error(&mut state, error));
        }

        let behavior = state.confirm_behavior;
        let confirm = match state.channels.get_mut(&self.at) {
            Some(channel) => match channel.confirms.clone() {
                Some(sender) => {
                    channel.publish_seq += 1;
                    Some((sender, channel.publish_seq))
                }
                None => None,
            },
            None => None,
        };

        match (confirm, behavior) {
            (Some((sender, sequence)), ConfirmBehavior::Nack) => {
                let _ = sender.send(Confirmation::nack(sequence));
            }
            (Some((sender, sequence)), ConfirmBehavior::Ack) => {
                state.enqueue(exchange, routing_key, payload, properties);
                let _ = sender.send(Confirmation::ack(sequence));
            }
            (Some((_, sequence)), ConfirmBehavior::Hold) => {
                state.enqueue(exchange, routing_key, payload, properties);
                state.held_confirms.push((self.at, sequence));
            }
            (None, _) => state.enqueue(exchange, routing_key, payload, properties),
        }
        Ok(())
    }

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::Consume {
            at: self.at,
            queue: queue.to_string(),
            consumer_tag: consumer_tag.to_string(),
        });

        if !state.queues.contains_key(queue) {
            let error = BrokerError::not_found(format!("no queue '{}'", queue));
            return Err(self.channel_error(&mut state, error));
        }

        let tag = if consumer_tag.is_empty() {
            let channel = state
                .channels
                .get_mut(&self.at)
                .ok_or_else(|| BrokerError::Protocol("unknown channel".to_string()))?;
            channel.next_consumer_tag += 1;
            format!("amq.ctag-{}-{}", self.at.channel, channel.next_consumer_tag)
        } else {
            consumer_tag.to_string()
        };

        let (tx, rx) = stream_mpsc::unbounded();
        if let Some(q) = state.queues.get_mut(queue) {
            q.consumers.push(ConsumerEntry {
                at: self.at,
                tag,
                sender: tx,
            });
        }
        state.dispatch(queue);

        Ok(rx.boxed())
    }

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::Ack {
            at: self.at,
            delivery_tag,
        });

        let removed = state
            .channels
            .get_mut(&self.at)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        match removed {
            Some(_) => Ok(()),
            None => {
                let error = BrokerError::precondition_failed(format!(
                    "unknown delivery tag {}",
                    delivery_tag
                ));
                Err(self.channel_error(&mut state, error))
            }
        }
    }

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::Nack {
            at: self.at,
            delivery_tag,
            requeue,
        });

        let removed = state
            .channels
            .get_mut(&self.at)
            .and_then(|c| c.unacked.remove(&delivery_tag));
        match removed {
            Some((queue_name, mut message)) => {
                if requeue {
                    if let Some(queue) = state.queues.get_mut(&queue_name) {
                        message.redelivered = true;
                        queue.ready.push_front(message);
                    }
                    state.dispatch(&queue_name);
                }
                Ok(())
            }
            None => {
                let error = BrokerError::precondition_failed(format!(
                    "unknown delivery tag {}",
                    delivery_tag
                ));
                Err(self.channel_error(&mut state, error))
            }
        }
    }

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ensure_channel_open(self.at)?;
        state.ops.push(BrokerOp::Cancel {
            at: self.at,
            consumer_tag: consumer_tag.to_string(),
        });

        let at = self.at;
        for queue in state.queues.values_mut() {
            queue
                .consumers
                .retain(|c| !(c.at == at && c.tag == consumer_tag));
        }
        Ok(())
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.broker.state.lock();
        state.ops.push(BrokerOp::CloseChannel { at: self.at });
        state.close_channel(self.at);
        Ok(())
    }
}
