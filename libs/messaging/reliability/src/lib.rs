//! # Publish/Consume Reliability Core
//!
//! Delivery-confirmation tracking, acknowledgement discipline and reconnect
//! supervision for a relay talking to a message broker through the
//! [`broker`] trait seam.
//!
//! ## Components
//!
//! - [`ConnectionSupervisor`]: the single logical connection, its state
//!   machine and the reconnect loop driven by a [`ReconnectPolicy`]
//! - [`TopologyManager`]: idempotent exchange/queue/binding setup
//! - [`PublisherChannel`]: confirm-mode publishing with a
//!   [`DeliveryTracker`] reconciling acks and nacks
//! - [`ConsumerChannel`]: subscription and exactly-once settlement of
//!   delivery tags according to an [`AckMode`]
//!
//! All broker-layer errors bubble up to the supervisor, which alone decides
//! between reconnecting and shutting down.

pub mod consumer;
pub mod error;
pub mod policy;
pub mod publisher;
pub mod supervisor;
pub mod topology;
pub mod tracker;

pub use consumer::{
    AckMode, ConsumerChannel, ConsumerOptions, ConsumerState, Settlement, DEFAULT_CONSUMER_TAG,
};
pub use error::{ReliabilityError, Result, TopologyStep};
pub use policy::{ReconnectPolicy, DEFAULT_RECONNECT_DELAY};
pub use publisher::{PublisherChannel, PublisherOptions, PublisherStats, DEFAULT_APP_ID};
pub use supervisor::{
    redact_url, ChannelHandle, ConnectionSession, ConnectionSupervisor, SessionEnd,
    SupervisorMetrics, SupervisorStats,
};
pub use topology::{BoundQueue, TopologyManager};
pub use tracker::DeliveryTracker;
