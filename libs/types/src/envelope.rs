//! # Message Envelope
//!
//! Outbound messages are wrapped before publishing so that every copy the
//! relay emits carries its own identifier, independent of whatever the
//! original producer put in `_id`:
//!
//! ```text
//! inbound:  {"_id": "X", "type": "temperatura", "message": 34}
//! outbound: {"data": {"_id": "X", "type": "temperatura", "message": 34},
//!            "_id": "6f1c...-uuid"}
//! ```
//!
//! The original payload is nested verbatim under `data`.

use crate::error::EnvelopeError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use uuid::Uuid;

/// Field holding the wrapped payload in the outbound wire form
pub const PAYLOAD_FIELD: &str = "data";

/// Field holding the message identifier, inbound and outbound
pub const MESSAGE_ID_FIELD: &str = "_id";

/// Immutable payload wrapper with a generated identifier
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    id: Uuid,
    payload: Value,
    created_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct WireEnvelope<'a> {
    data: &'a Value,
    #[serde(rename = "_id")]
    id: String,
}

impl Envelope {
    /// Wrap a payload, generating a fresh v4 identifier
    pub fn new(payload: Value) -> Self {
        Self::with_id(Uuid::new_v4(), payload)
    }

    /// Wrap a payload under a caller-chosen identifier
    pub fn with_id(id: Uuid, payload: Value) -> Self {
        Self {
            id,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Serialize to the outbound wire form `{"data": ..., "_id": ...}`
    pub fn to_wire(&self) -> Result<Vec<u8>, EnvelopeError> {
        let wire = WireEnvelope {
            data: &self.payload,
            id: self.id.to_string(),
        };
        serde_json::to_vec(&wire).map_err(|source| EnvelopeError::Encode {
            id: self.id,
            source,
        })
    }
}

/// A delivery taken off the inbound queue, with its body decoded as JSON
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    /// Per-channel tag assigned by the broker, used for acknowledgement
    pub delivery_tag: u64,
    /// Set by the broker when this message was delivered before and not acked
    pub redelivered: bool,
    /// Decoded body
    pub payload: Value,
    /// The producer's `_id`, when the body carries one
    pub message_id: Option<String>,
}

impl InboundMessage {
    /// Decode a raw delivery body
    pub fn decode(delivery_tag: u64, redelivered: bool, body: &[u8]) -> Result<Self, EnvelopeError> {
        let payload: Value = serde_json::from_slice(body)
            .map_err(|source| EnvelopeError::Decode { delivery_tag, source })?;

        let message_id = match payload.get(MESSAGE_ID_FIELD) {
            Some(Value::String(id)) => Some(id.clone()),
            Some(Value::Null) | None => None,
            Some(other) => Some(other.to_string()),
        };

        Ok(Self {
            delivery_tag,
            redelivered,
            payload,
            message_id,
        })
    }
}
