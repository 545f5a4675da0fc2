//! Topic-multiplexed channel protocol over a single WebSocket.
//!
//! # Architecture
//!
//! ```text
//! Socket (cloneable handle)
//!     │
//!     ├── connection loop task (one per open connection)
//!     │     ├── WsReader ──► Frame::decode ──► dispatcher::route
//!     │     └── WsWriter ◄── outbound queue ◄── push / join / leave
//!     │
//!     ├── TopicRegistry      topic → event → [callback, ...]
//!     └── CorrelationTable   ref → pending reply (join or request)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let socket = Socket::builder("wss://example.com/socket/websocket")
//!     .token("secret")
//!     .build();
//! socket.connect().await?;
//!
//! socket.join("room:1").await?;
//! socket.on("room:1", "msg", |payload| println!("{payload}"));
//! socket.push("room:1", "msg", json!({"text": "hi"}), None);
//! ```
//!
//! Joining is reply-gated: the topic only enters the registry when the
//! server's `phx_reply` for the join arrives. Leaving is local and immediate.

pub mod correlation;
pub mod dispatcher;
pub mod frame;
pub mod registry;
pub mod socket;

use serde_json::Value;

/// Lifecycle of the socket's single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Never connected, or the last connect attempt failed.
    #[default]
    Disconnected,
    /// Handshake in progress.
    Connecting,
    /// Connected; frames flow both ways.
    Open,
    /// Torn down locally or by the remote. No frames are delivered.
    Closed,
}

/// Errors surfaced by channel operations.
#[derive(Debug)]
pub enum ChannelError {
    /// Transport failed before the connection opened.
    ConnectionFailed(String),
    /// No join reply arrived within the join window.
    JoinTimeout {
        /// Topic that was being joined.
        topic: String,
    },
    /// The server answered the join with an error status.
    JoinRejected {
        /// Topic that was being joined.
        topic: String,
        /// Response body of the error reply.
        reason: Value,
    },
    /// No reply arrived for a correlated request within the reply window.
    ReplyTimeout {
        /// Ref of the unanswered frame.
        reference: frame::MessageRef,
    },
    /// The connection is not open.
    NotConnected,
    /// The connection was torn down while a reply was awaited.
    Closed,
    /// A frame could not be encoded or decoded.
    MalformedFrame(String),
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionFailed(msg) => write!(f, "Connection failed: {msg}"),
            Self::JoinTimeout { topic } => write!(f, "Join timeout for topic {topic}"),
            Self::JoinRejected { topic, reason } => {
                write!(f, "Join rejected for topic {topic}: {reason}")
            }
            Self::ReplyTimeout { reference } => write!(f, "No reply for ref {reference}"),
            Self::NotConnected => write!(f, "Socket not connected"),
            Self::Closed => write!(f, "Socket closed"),
            Self::MalformedFrame(msg) => write!(f, "Malformed frame: {msg}"),
        }
    }
}

impl std::error::Error for ChannelError {}

pub use frame::{Frame, MessageRef, ReplyStatus, JOIN_EVENT, LEAVE_EVENT, REPLY_EVENT};
pub use registry::{Callback, TopicRegistry};
pub use socket::{Socket, SocketBuilder};
