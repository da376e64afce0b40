use thiserror::Error;
use types::CloseReason;

/// AMQP reply code for a precondition failure (e.g. inequivalent re-declare)
pub const REPLY_PRECONDITION_FAILED: u16 = 406;
/// AMQP reply code for a missing exchange or queue
pub const REPLY_NOT_FOUND: u16 = 404;

#[derive(Debug, Clone, Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Connection closed: {0}")]
    ConnectionClosed(CloseReason),

    #[error("Channel {channel} closed: {reason}")]
    ChannelClosed { channel: u16, reason: CloseReason },

    /// Re-declare with different parameters, ack of an unknown tag, ...
    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl BrokerError {
    /// Check if the whole connection is gone, not just a channel
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionFailed(_) | BrokerError::ConnectionClosed(_)
        )
    }

    /// Check if the broker closed the channel as a consequence of this error
    pub fn is_channel_error(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed { .. }
                | BrokerError::PreconditionFailed(_)
                | BrokerError::NotFound(_)
        )
    }

    /// Close reason to report when this error tears the connection down
    pub fn close_reason(&self) -> CloseReason {
        match self {
            BrokerError::ConnectionClosed(reason) => reason.clone(),
            BrokerError::ChannelClosed { reason, .. } => reason.clone(),
            BrokerError::PreconditionFailed(text) => {
                CloseReason::new(REPLY_PRECONDITION_FAILED, text.clone())
            }
            BrokerError::NotFound(text) => CloseReason::new(REPLY_NOT_FOUND, text.clone()),
            BrokerError::ConnectionFailed(text) | BrokerError::Protocol(text) => {
                CloseReason::connection_lost(text.clone())
            }
        }
    }

    pub fn precondition_failed(msg: impl Into<String>) -> Self {
        BrokerError::PreconditionFailed(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BrokerError::NotFound(msg.into())
    }

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        BrokerError::ConnectionFailed(msg.into())
    }
}

pub type BrokerResult<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        let lost = BrokerError::ConnectionClosed(CloseReason::connection_lost("reset"));
        assert!(lost.is_connection_error());
        assert!(!lost.is_channel_error());

        let mismatch = BrokerError::precondition_failed("inequivalent arg 'durable'");
        assert!(mismatch.is_channel_error());
        assert_eq!(mismatch.close_reason().code, REPLY_PRECONDITION_FAILED);
    }
}
