//! Frame encoder for the engine's stdin.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::io::{AsyncWrite, AsyncWriteExt};

use super::{LF, RS};

/// A message paired with the node that should receive it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Injection {
    pub node_id: String,
    pub payload: Value,
}

impl Injection {
    pub fn new(node_id: impl Into<String>, payload: Value) -> Self {
        Self {
            node_id: node_id.into(),
            payload,
        }
    }

    /// The `{"nid", "msg"}` envelope that goes on the wire.
    ///
    /// A payload that is already an envelope (an object with both `nid` and
    /// `msg`) is forwarded as-is and its own target wins over `node_id`.
    pub fn envelope(&self) -> Value {
        if is_envelope(&self.payload) {
            return self.payload.clone();
        }
        json!({ "nid": self.node_id, "msg": self.payload })
    }

    /// Target node as it will appear on the wire.
    pub fn target(&self) -> &str {
        if is_envelope(&self.payload) {
            if let Some(nid) = self.payload.get("nid").and_then(Value::as_str) {
                return nid;
            }
        }
        &self.node_id
    }
}

fn is_envelope(payload: &Value) -> bool {
    payload
        .as_object()
        .is_some_and(|obj| obj.contains_key("nid") && obj.contains_key("msg"))
}

/// Address a list of bare payloads (or ready envelopes) to a default node.
pub fn injections_to(node_id: &str, payloads: impl IntoIterator<Item = Value>) -> Vec<Injection> {
    payloads
        .into_iter()
        .map(|payload| Injection::new(node_id, payload))
        .collect()
}

/// Append one frame for `value` to `buf`.
///
/// Compact serde_json output escapes every control character inside
/// strings, so the payload never contains a raw `RS` or `LF`.
pub fn encode_frame(value: &Value, buf: &mut Vec<u8>) -> Result<(), serde_json::Error> {
    buf.push(RS);
    serde_json::to_writer(&mut *buf, value)?;
    buf.push(LF);
    Ok(())
}

/// Encode the whole stdin payload: the flow definition frame followed by one
/// frame per injection, in order.
pub fn encode_input(flows: &Value, injections: &[Injection]) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::new();
    encode_frame(flows, &mut buf)?;
    for injection in injections {
        encode_frame(&injection.envelope(), &mut buf)?;
    }
    Ok(buf)
}

/// Write the encoded input, flush, and close the stream so the child sees
/// end-of-input.
pub async fn write_input<W>(mut writer: W, input: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(input).await?;
    writer.flush().await?;
    writer.shutdown().await?;
    Ok(())
}
