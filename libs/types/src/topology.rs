//! # Broker Topology
//!
//! A [`Topology`] names the exchange, queue and binding that must exist before
//! traffic flows in one direction. The relay carries one value per direction
//! so inbound and outbound wiring can never be confused with each other.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange receiving messages from producers (sensors → relay)
pub const EXCHANGE_SENDER_TO_CORE: &str = "EXCHANGE_SENDER_TO_CORE";
/// Exchange the relay publishes to (relay → consumers)
pub const EXCHANGE_CORE_TO_SENDER: &str = "EXCHANGE_CORE_TO_SENDER";
/// Queue the relay consumes from
pub const QUEUE_SENDER_TO_CORE: &str = "task_queue_sender_to_core";
/// Queue bound to the outbound exchange
pub const QUEUE_CORE_TO_SENDER: &str = "task_queue_core_to_sender";
/// Routing key shared by both directions
pub const DEFAULT_ROUTING_KEY: &str = "example.text";

/// AMQP exchange types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    #[default]
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Headers => "headers",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange, queue and binding for one traffic direction
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Topology {
    pub exchange: String,
    #[serde(default)]
    pub exchange_kind: ExchangeKind,
    pub queue: String,
    pub routing_key: String,
    /// Declares survive a broker restart
    #[serde(default = "default_durable")]
    pub durable: bool,
}

fn default_durable() -> bool {
    true
}

impl Topology {
    pub fn new(
        exchange: impl Into<String>,
        exchange_kind: ExchangeKind,
        queue: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            exchange_kind,
            queue: queue.into(),
            routing_key: routing_key.into(),
            durable: true,
        }
    }

    /// Inbound direction: producers publish to `EXCHANGE_SENDER_TO_CORE`
    pub fn sender_to_core() -> Self {
        Self::new(
            EXCHANGE_SENDER_TO_CORE,
            ExchangeKind::Direct,
            QUEUE_SENDER_TO_CORE,
            DEFAULT_ROUTING_KEY,
        )
    }

    /// Outbound direction: the relay publishes to `EXCHANGE_CORE_TO_SENDER`
    pub fn core_to_sender() -> Self {
        Self::new(
            EXCHANGE_CORE_TO_SENDER,
            ExchangeKind::Direct,
            QUEUE_CORE_TO_SENDER,
            DEFAULT_ROUTING_KEY,
        )
    }

    /// Check that every name is usable; the broker would reject empty
    /// exchange or queue names for a durable binding.
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange.trim().is_empty() {
            return Err("exchange name must not be empty".to_string());
        }
        if self.queue.trim().is_empty() {
            return Err(format!("queue name for exchange '{}' must not be empty", self.exchange));
        }
        Ok(())
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) -> {} [{}]",
            self.exchange, self.exchange_kind, self.queue, self.routing_key
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_directions_are_distinct() {
        let inbound = Topology::sender_to_core();
        let outbound = Topology::core_to_sender();

        assert_ne!(inbound.exchange, outbound.exchange);
        assert_ne!(inbound.queue, outbound.queue);
        assert_eq!(inbound.routing_key, outbound.routing_key);
        assert!(inbound.durable && outbound.durable);
        assert_eq!(inbound.exchange_kind, ExchangeKind::Direct);
    }

    #[test]
    fn test_validate() {
        assert!(Topology::sender_to_core().validate().is_ok());

        let mut bad = Topology::core_to_sender();
        bad.queue = "  ".to_string();
        assert!(bad.validate().is_err());

        bad.exchange = String::new();
        assert!(bad.validate().unwrap_err().contains("exchange"));
    }

    #[test]
    fn test_exchange_kind_serde() {
        let topology: Topology = serde_json::from_str(
            r#"{"exchange":"ex","exchange_kind":"topic","queue":"q","routing_key":"a.*"}"#,
        )
        .unwrap();

        assert_eq!(topology.exchange_kind, ExchangeKind::Topic);
        assert!(topology.durable);
        assert_eq!(topology.to_string(), "ex (topic) -> q [a.*]");
    }
}
