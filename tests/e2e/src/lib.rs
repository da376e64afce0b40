//! End-to-end tests for the relay
//!
//! Runs a complete [`relay_server::RelayServer`] against the in-process
//! [`broker::MemoryBroker`], exercising the full path from inbound queue to
//! outbound queue including reconnects and shutdown.

pub mod fixtures;
pub mod framework;
pub mod validation;

pub use fixtures::*;
pub use framework::{RelayHarness, TestConfig};
pub use validation::*;
