//! Connection lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

/// AMQP reply code for a normal close
pub const REPLY_SUCCESS: u16 = 200;
/// Reply code used when the socket dropped without a close handshake
pub const REPLY_CONNECTION_LOST: u16 = 0;

/// Why a connection or channel closed
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CloseReason {
    pub code: u16,
    pub text: String,
}

impl CloseReason {
    pub fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    /// Closed on our request
    pub fn normal() -> Self {
        Self::new(REPLY_SUCCESS, "Normal shutdown")
    }

    /// Transport-level loss, no reply from the broker
    pub fn connection_lost(text: impl Into<String>) -> Self {
        Self::new(REPLY_CONNECTION_LOST, text)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}) {}", self.code, self.text)
    }
}

/// Lifecycle of the single logical broker connection
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Open,
    Closing,
    /// Closed on request; terminal
    Closed,
    /// Closed unexpectedly; the reconnect path applies
    Failed(CloseReason),
}

impl ConnectionState {
    pub fn is_open(&self) -> bool {
        matches!(self, ConnectionState::Open)
    }

    /// Terminal state reached after an explicit close
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Closed)
    }

    /// Legal transitions of the state machine
    pub fn can_transition_to(&self, next: &ConnectionState) -> bool {
        use ConnectionState::*;
        match (self, next) {
            (Closed, _) => false,
            (_, Closing) | (_, Closed) => true,
            (Disconnected, Connecting) | (Failed(_), Connecting) => true,
            (Connecting, Open) | (Connecting, Failed(_)) => true,
            (Open, Failed(_)) => true,
            (Closing, Failed(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Closing => f.write_str("closing"),
            ConnectionState::Closed => f.write_str("closed"),
            ConnectionState::Failed(reason) => write!(f, "failed {}", reason),
        }
    }
}
