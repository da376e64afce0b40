//! # Relay Service
//!
//! Consumes JSON messages from the inbound queue and republishes each one,
//! wrapped in an envelope with a fresh identifier, to the outbound exchange.
//! Built on the reliability core: publisher confirms, exactly-once
//! settlement of inbound deliveries and supervised reconnects.

pub mod server;

pub use server::RelayServer;
