//! Errors raised while encoding or decoding message bodies.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    /// Outbound envelope could not be serialized
    #[error("Failed to encode envelope {id}: {source}")]
    Encode {
        id: uuid::Uuid,
        #[source]
        source: serde_json::Error,
    },

    /// Inbound body is not valid JSON
    #[error("Failed to decode delivery {delivery_tag}: {source}")]
    Decode {
        delivery_tag: u64,
        #[source]
        source: serde_json::Error,
    },
}
