//! Assertions on relayed messages

use anyhow::{anyhow, bail, Context, Result};
use serde_json::Value;
use uuid::Uuid;

/// Check that `body` is an outbound envelope carrying `expected` and return
/// its identifier
pub fn assert_wrapped(body: &[u8], expected: &Value) -> Result<Uuid> {
    let wire: Value = serde_json::from_slice(body).context("outbound body is not JSON")?;
    let object = wire
        .as_object()
        .ok_or_else(|| anyhow!("outbound body is not an object: {wire}"))?;

    if object.len() != 2 {
        bail!("unexpected envelope fields: {wire}");
    }
    let data = object
        .get("data")
        .ok_or_else(|| anyhow!("envelope has no data field"))?;
    if data != expected {
        bail!("payload changed in transit: expected {expected}, got {data}");
    }

    let id = object
        .get("_id")
        .and_then(Value::as_str)
        .ok_or_else(|| anyhow!("envelope has no string _id"))?;
    Uuid::parse_str(id).with_context(|| format!("envelope id {id} is not a UUID"))
}
