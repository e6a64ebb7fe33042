//! Gateway wire protocol
//!
//! One JSON object per frame: `{"type": ..., "id": ..., "payload": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::robot::ActionResult;
use crate::{Error, Result};

/// Correlation id of an outbound `message.send`
pub type MessageId = uuid::Uuid;

const MESSAGE_SEND: &str = "message.send";
const MESSAGE_REPLY: &str = "message.reply";
const TOOL_REQUEST: &str = "tool.request";
const TOOL_RESPONSE: &str = "tool.response";
const ERROR: &str = "error";

/// Raw frame as it appears on the wire
#[derive(Debug, Serialize, Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default)]
    payload: Value,
}

/// Action request from the gateway
#[derive(Debug, Clone, PartialEq)]
pub struct ToolRequest {
    /// Request id, echoed in the `tool.response`
    pub id: String,
    /// Action name as sent by the peer
    pub name: String,
    /// Action arguments (an object, empty when absent)
    pub arguments: Value,
}

/// Inbound frame after demultiplexing
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    /// Spoken reply text
    Reply { id: Option<String>, text: String },
    /// Action the robot should perform
    ToolRequest(ToolRequest),
    /// Gateway-side failure
    Error {
        id: Option<String>,
        code: String,
        message: String,
    },
}

/// Frames the bridge sends
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Transcribed user text
    Send { id: MessageId, text: String },
    /// Answer to a `tool.request`
    ToolResponse { id: String, result: ActionResult },
}

impl OutboundMessage {
    /// Serialize to a JSON frame
    ///
    /// # Errors
    ///
    /// Returns error if serialization fails
    pub fn encode(&self) -> Result<String> {
        let frame = match self {
            Self::Send { id, text } => WireFrame {
                kind: MESSAGE_SEND.to_string(),
                id: Some(id.to_string()),
                payload: Value::String(text.clone()),
            },
            Self::ToolResponse { id, result } => WireFrame {
                kind: TOOL_RESPONSE.to_string(),
                id: Some(id.clone()),
                payload: match result {
                    Ok(value) => json!({ "result": value }),
                    Err(message) => json!({ "error": message }),
                },
            },
        };
        Ok(serde_json::to_string(&frame)?)
    }
}

/// Parse one inbound frame
///
/// # Errors
///
/// Returns `Error::ProtocolDesync` for non-JSON bodies, unknown types,
/// outbound-only types, replies without text and tool requests without an id
pub fn decode(text: &str) -> Result<InboundMessage> {
    let frame: WireFrame = serde_json::from_str(text)
        .map_err(|e| Error::ProtocolDesync(format!("invalid frame: {e}")))?;

    match frame.kind.as_str() {
        MESSAGE_REPLY => {
            let text = match frame.payload {
                Value::String(s) => s,
                Value::Object(ref map) => map
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| Error::ProtocolDesync("reply without text".into()))?,
                _ => return Err(Error::ProtocolDesync("reply without text".into())),
            };
            Ok(InboundMessage::Reply { id: frame.id, text })
        }
        TOOL_REQUEST => {
            let id = frame
                .id
                .ok_or_else(|| Error::ProtocolDesync("tool.request without id".into()))?;
            // Nameless requests still get a tool.response
            let name = match frame.payload.get("name") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    tracing::warn!(request = %id, "tool.request without name");
                    String::new()
                }
                Some(other) => other.to_string(),
            };
            let arguments = match frame.payload.get("arguments") {
                Some(Value::Null) | None => Value::Object(serde_json::Map::new()),
                Some(args) => args.clone(),
            };
            Ok(InboundMessage::ToolRequest(ToolRequest {
                id,
                name,
                arguments,
            }))
        }
        ERROR => {
            let code = match frame.payload.get("code") {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "unknown".to_string(),
                Some(other) => other.to_string(),
            };
            let message = frame
                .payload
                .get("message")
                .or_else(|| frame.payload.get("description"))
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            Ok(InboundMessage::Error {
                id: frame.id,
                code,
                message,
            })
        }
        MESSAGE_SEND | TOOL_RESPONSE => Err(Error::ProtocolDesync(format!(
            "peer sent outbound-only frame type '{}'",
            frame.kind
        ))),
        other => Err(Error::ProtocolDesync(format!("unknown frame type '{other}'"))),
    }
}
