//! phx-socket - topic-multiplexed channel client.
//!
//! Many logical topics share one persistent WebSocket. The client joins and
//! leaves topics, routes server events to per-topic callbacks, and correlates
//! pushes with their replies by a client-generated ref.
//!
//! # Modules
//!
//! - [`channel`] - socket client, topic registry, correlation table, dispatcher
//! - [`config`] - connection settings, file and environment loading
//! - [`ws`] - WebSocket transport

pub mod channel;
pub mod config;
pub mod ws;

pub use channel::{
    ChannelError, ConnectionState, Frame, MessageRef, ReplyStatus, Socket, SocketBuilder,
};
pub use config::SocketConfig;
