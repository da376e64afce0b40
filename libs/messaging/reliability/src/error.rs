use broker::BrokerError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use types::{CloseReason, DeliveryRecord, EnvelopeError};

/// Round trip of topology setup that failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopologyStep {
    DeclareExchange,
    DeclareQueue,
    BindQueue,
}

impl TopologyStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            TopologyStep::DeclareExchange => "exchange.declare",
            TopologyStep::DeclareQueue => "queue.declare",
            TopologyStep::BindQueue => "queue.bind",
        }
    }
}

impl fmt::Display for TopologyStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum ReliabilityError {
    /// Connection lost or refused; the supervisor reconnects
    #[error("Connection error: {0}")]
    Connection(#[source] BrokerError),

    /// Topology could not be ensured; the channel is unusable
    #[error("Topology error at {step} for {topology}: {source}")]
    Topology {
        step: TopologyStep,
        topology: String,
        #[source]
        source: BrokerError,
    },

    #[error("{count} deliveries left unconfirmed", count = records.len())]
    DeliveryUnconfirmed { records: Vec<DeliveryRecord> },

    #[error("Handler failed: {reason}")]
    Handler { reason: String, requeue: bool },

    #[error("No broker channel attached")]
    ChannelUnavailable,

    #[error("Delivery {0} already settled")]
    AlreadySettled(u64),

    #[error("Consumer {0} cancelled by the broker")]
    ConsumerCancelled(String),

    #[error("Timed out after {timeout:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        timeout: Duration,
    },

    #[error("Gave up after {0} reconnect attempts")]
    ReconnectExhausted(u32),

    #[error("Supervisor is closed")]
    Closed,

    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] EnvelopeError),
}

impl ReliabilityError {
    /// Classify a broker error: connection-level failures become `Connection`
    pub fn from_broker(err: BrokerError) -> Self {
        if err.is_connection_error() {
            ReliabilityError::Connection(err)
        } else {
            ReliabilityError::Broker(err)
        }
    }

    pub fn handler(reason: impl Into<String>) -> Self {
        ReliabilityError::Handler {
            reason: reason.into(),
            requeue: true,
        }
    }

    /// Handler failure that redelivery cannot fix
    pub fn handler_fatal(reason: impl Into<String>) -> Self {
        ReliabilityError::Handler {
            reason: reason.into(),
            requeue: false,
        }
    }

    /// Check if a fresh connection session can recover from this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ReliabilityError::Connection(_)
            | ReliabilityError::Topology { .. }
            | ReliabilityError::ChannelUnavailable
            | ReliabilityError::ConsumerCancelled(_)
            | ReliabilityError::Timeout { .. } => true,
            ReliabilityError::Broker(err) => err.is_channel_error(),
            _ => false,
        }
    }

    pub fn is_connection_error(&self) -> bool {
        matches!(self, ReliabilityError::Connection(_))
    }

    /// Check if the failed delivery should go back to the queue
    pub fn should_requeue(&self) -> bool {
        match self {
            ReliabilityError::Handler { requeue, .. } => *requeue,
            ReliabilityError::Serialization(_) => false,
            _ => true,
        }
    }

    /// Reason reported when this error ends a connection session
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ReliabilityError::Connection(err) | ReliabilityError::Broker(err) => err.close_reason(),
            ReliabilityError::Topology { source, .. } => source.close_reason(),
            other => CloseReason::connection_lost(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, ReliabilityError>;

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_broker_errors_are_classified() {
        let lost = ReliabilityError::from_broker(BrokerError::ConnectionClosed(
            CloseReason::connection_lost("reset"),
        ));
        assert!(lost.is_connection_error());
        assert!(lost.is_recoverable());

        let mismatch = ReliabilityError::from_broker(BrokerError::precondition_failed("durable"));
        assert!(!mismatch.is_connection_error());
        assert!(mismatch.is_recoverable());
        assert_eq!(mismatch.close_reason().code, broker::error::REPLY_PRECONDITION_FAILED);
    }

    #[test]
    fn test_requeue_classification() {
        assert!(ReliabilityError::handler("downstream busy").should_requeue());
        assert!(!ReliabilityError::handler_fatal("bad payload").should_requeue());

        let decode = serde_json::from_slice::<serde_json::Value>(b"{")
            .map_err(|source| EnvelopeError::Decode {
                delivery_tag: 1,
                source,
            })
            .unwrap_err();
        assert!(!ReliabilityError::from(decode).should_requeue());
    }

    #[test]
    fn test_unconfirmed_message_counts_records() {
        let err = ReliabilityError::DeliveryUnconfirmed {
            records: vec![
                DeliveryRecord::pending(1, Uuid::new_v4()),
                DeliveryRecord::pending(2, Uuid::new_v4()),
            ],
        };
        assert_eq!(err.to_string(), "2 deliveries left unconfirmed");
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_topology_error_names_step() {
        let err = ReliabilityError::Topology {
            step: TopologyStep::BindQueue,
            topology: "ex (direct) -> q [rk]".to_string(),
            source: BrokerError::not_found("no exchange 'ex'"),
        };
        assert!(err.to_string().contains("queue.bind"));
        assert_eq!(err.close_reason().code, broker::error::REPLY_NOT_FOUND);
    }
}
