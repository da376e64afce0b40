//! # Relay Types
//!
//! Value types shared by every layer of the broker relay.
//!
//! ## Contents
//!
//! - [`Envelope`]: outbound payload plus generated identifier, and its wire form
//! - [`InboundMessage`]: a decoded delivery taken off the inbound queue
//! - [`Topology`]: exchange/queue/routing-key triple for one traffic direction
//! - [`DeliveryRecord`] and [`Confirmation`]: publisher-confirm bookkeeping
//! - [`ConnectionState`] and [`CloseReason`]: connection lifecycle
//!
//! None of these types perform I/O. The broker adapters and the reliability
//! core build on them.

pub mod connection;
pub mod delivery;
pub mod envelope;
pub mod error;
pub mod topology;

pub use connection::{CloseReason, ConnectionState, REPLY_CONNECTION_LOST, REPLY_SUCCESS};
pub use delivery::{Confirmation, ConfirmationKind, DeliveryRecord, DeliveryState};
pub use envelope::{Envelope, InboundMessage, MESSAGE_ID_FIELD, PAYLOAD_FIELD};
pub use error::EnvelopeError;
pub use topology::{
    ExchangeKind, Topology, DEFAULT_ROUTING_KEY, EXCHANGE_CORE_TO_SENDER, EXCHANGE_SENDER_TO_CORE,
    QUEUE_CORE_TO_SENDER, QUEUE_SENDER_TO_CORE,
};
