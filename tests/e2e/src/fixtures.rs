//! Sample inbound messages

use serde_json::{json, Value};

/// Sensor reading as produced by the sender side
pub fn temperature_reading() -> Value {
    json!({"_id": "X", "type": "temperatura", "message": 34})
}

/// Reading with a distinct inbound id, for ordering checks
pub fn numbered_reading(n: u64) -> Value {
    json!({"_id": format!("reading-{n}"), "type": "temperatura", "message": n})
}

/// Body that is not JSON at all
pub const MALFORMED_BODY: &str = "{\"_id\": \"broken\", \"type\":";
