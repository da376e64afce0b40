//! # Broker Abstraction
//!
//! Async trait seam between the relay's reliability core and the message
//! broker. The core only ever talks to [`Connector`], [`BrokerConnection`] and
//! [`BrokerChannel`], so the same supervision, topology and confirmation logic
//! runs against:
//!
//! - [`amqp::AmqpConnector`]: a real AMQP 0-9-1 broker through `lapin`
//!   (feature `amqp`, enabled by default)
//! - [`memory::MemoryBroker`]: an in-process broker used by tests, able to
//!   simulate connection loss, remote cancellation and negative confirms
//!
//! ## Channel Contract
//!
//! Every RPC on a [`BrokerChannel`] resolves only after the broker replied
//! (`declare-ok`, `bind-ok`, `select-ok`, ...). Callers that need ordering
//! simply await one call before issuing the next.
//!
//! Deliveries and publisher confirms are asynchronous broker-to-client events
//! and are surfaced as a [`DeliveryStream`] and a [`ConfirmationStream`]. Both
//! end when the channel closes.

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod error;
pub mod memory;

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use types::{CloseReason, Confirmation, ExchangeKind};

pub use error::{BrokerError, BrokerResult};
pub use memory::{BrokerOp, ConfirmBehavior, MemoryBroker};

/// Stream of messages pushed to a consumer; ends on cancellation or channel loss
pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

/// Publisher confirms for a channel in confirm mode; ends when the channel closes
pub type ConfirmationStream = mpsc::UnboundedReceiver<Confirmation>;

/// A message delivered to a consumer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
}

/// Basic properties attached to a published message
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PublishProperties {
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Delivery mode 2: the broker writes the message to disk
    pub persistent: bool,
}

impl PublishProperties {
    pub fn json(app_id: impl Into<String>) -> Self {
        Self {
            app_id: Some(app_id.into()),
            content_type: Some("application/json".to_string()),
            message_id: None,
            persistent: true,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }
}

/// Opens connections to a broker
#[async_trait]
pub trait Connector: Send + Sync + Debug {
    /// Connect to the broker at `url`, resolving once the connection is open
    async fn connect(&self, url: &str) -> BrokerResult<Arc<dyn BrokerConnection>>;
}

/// One open connection to the broker
#[async_trait]
pub trait BrokerConnection: Send + Sync + Debug {
    /// Open a new channel on this connection
    async fn open_channel(&self) -> BrokerResult<Arc<dyn BrokerChannel>>;

    /// Check if the connection is still open
    fn is_open(&self) -> bool;

    /// Resolve once the connection has closed, for whatever reason
    async fn closed(&self) -> CloseReason;

    /// Close the connection with the given reply
    async fn close(&self, reason: CloseReason) -> BrokerResult<()>;
}

/// A channel multiplexed over a [`BrokerConnection`]
#[async_trait]
pub trait BrokerChannel: Send + Sync + Debug {
    /// Channel number within its connection
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    async fn exchange_declare(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
    ) -> BrokerResult<()>;

    /// Declare a queue, returning the name the broker assigned
    async fn queue_declare(&self, queue: &str, durable: bool) -> BrokerResult<String>;

    async fn queue_bind(&self, queue: &str, exchange: &str, routing_key: &str)
        -> BrokerResult<()>;

    /// Put the channel in confirm mode. Irreversible for the channel's lifetime.
    async fn confirm_select(&self) -> BrokerResult<ConfirmationStream>;

    async fn basic_publish(
        &self,
        exchange: &str,
        routing_key: &str,
        payload: &[u8],
        properties: &PublishProperties,
    ) -> BrokerResult<()>;

    async fn basic_consume(&self, queue: &str, consumer_tag: &str) -> BrokerResult<DeliveryStream>;

    async fn basic_ack(&self, delivery_tag: u64) -> BrokerResult<()>;

    async fn basic_nack(&self, delivery_tag: u64, requeue: bool) -> BrokerResult<()>;

    async fn basic_cancel(&self, consumer_tag: &str) -> BrokerResult<()>;

    async fn close(&self) -> BrokerResult<()>;
}
