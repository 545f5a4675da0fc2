//! Wire frame and message references.
//!
//! Every message on the socket is one JSON object:
//!
//! ```text
//! { "topic": "room:1", "event": "msg", "payload": {...}, "ref": "7" }
//! ```
//!
//! Client-originated frames always carry a ref. Server broadcasts carry an
//! empty, null, or missing ref and are never correlated.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::ChannelError;

/// Event sent to subscribe to a topic.
pub const JOIN_EVENT: &str = "phx_join";
/// Event sent to unsubscribe from a topic.
pub const LEAVE_EVENT: &str = "phx_leave";
/// Event the server uses for every correlated reply.
pub const REPLY_EVENT: &str = "phx_reply";

/// Client-generated correlation id.
///
/// Produced from a per-socket counter, so values are unique for the lifetime
/// of a [`Socket`](super::Socket) and survive reconnects without reuse.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageRef(String);

impl MessageRef {
    /// The ref as sent on the wire.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<u64> for MessageRef {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

impl From<&str> for MessageRef {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for MessageRef {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::fmt::Display for MessageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Topic the frame is scoped to.
    pub topic: String,
    /// Event name within the topic.
    pub event: String,
    /// Opaque event payload.
    #[serde(default)]
    pub payload: Value,
    /// Correlation ref. `None` for uncorrelated server pushes.
    #[serde(rename = "ref", default, deserialize_with = "deserialize_ref")]
    pub reference: Option<MessageRef>,
}

/// Empty-string refs are how servers mark broadcasts; treat them as absent.
fn deserialize_ref<'de, D>(deserializer: D) -> Result<Option<MessageRef>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::String(s)) if !s.is_empty() => Some(MessageRef(s)),
        Some(Value::Number(n)) => Some(MessageRef(n.to_string())),
        _ => None,
    })
}

impl Serialize for MessageRef {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MessageRef {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self)
    }
}

impl Frame {
    /// Build a client-originated frame.
    pub fn outbound(
        topic: impl Into<String>,
        event: impl Into<String>,
        payload: Value,
        reference: MessageRef,
    ) -> Self {
        Self {
            topic: topic.into(),
            event: event.into(),
            payload,
            reference: Some(reference),
        }
    }

    /// Encode as the JSON text sent on the socket.
    pub fn encode(&self) -> Result<String, ChannelError> {
        serde_json::to_string(self).map_err(|e| ChannelError::MalformedFrame(e.to_string()))
    }

    /// Decode one inbound text message.
    pub fn decode(text: &str) -> Result<Self, ChannelError> {
        serde_json::from_str(text).map_err(|e| ChannelError::MalformedFrame(e.to_string()))
    }

    /// Whether this is a reply to an earlier client frame.
    #[must_use]
    pub fn is_reply(&self) -> bool {
        self.event == REPLY_EVENT
    }
}

/// Outcome carried by a reply payload.
///
/// Replies conventionally look like `{"status": "ok", "response": {...}}`.
/// Anything that is not an explicit `"error"` status counts as success.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyStatus {
    /// Successful reply with its response body.
    Ok(Value),
    /// Explicit error reply with its response body.
    Error(Value),
}

impl ReplyStatus {
    /// Classify a reply payload.
    #[must_use]
    pub fn from_payload(payload: Value) -> Self {
        let is_error = payload.get("status").and_then(Value::as_str) == Some("error");
        let body = match payload {
            Value::Object(mut map) if map.contains_key("status") => {
                map.remove("response").unwrap_or(Value::Null)
            }
            other => other,
        };
        if is_error {
            Self::Error(body)
        } else {
            Self::Ok(body)
        }
    }
}
