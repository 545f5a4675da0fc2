//! WebSocket transport for the channel socket.
//!
//! Wraps `tokio-tungstenite` in a writer/reader pair so the connection loop
//! can drive both halves from one `tokio::select!`. Only text frames carry
//! protocol data; binary frames are surfaced so the caller can log and drop
//! them.

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type.
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// A message read from the socket.
#[derive(Debug)]
pub enum WsMessage {
    /// UTF-8 text frame (one encoded protocol frame).
    Text(String),
    /// Binary frame. Not part of the JSON protocol.
    Binary(Vec<u8>),
    /// Ping from the remote, to be answered with a pong.
    Ping(Vec<u8>),
    /// Close frame.
    Close {
        /// WebSocket close code (1005 when the remote sent none).
        code: u16,
        /// Close reason, possibly empty.
        reason: String,
    },
}

/// Write half of the transport. Exactly one writer exists per connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send one encoded frame as a text message.
    pub async fn send_text(&mut self, text: String) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text))
            .await
            .context("WebSocket send failed")
    }

    /// Answer a ping.
    pub async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket pong failed")
    }

    /// Send a close frame and flush the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket close frame failed")?;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of the transport. Exactly one reader exists per connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

impl WsReader {
    /// Next message, or `None` once the stream has ended.
    ///
    /// Pongs and raw frames are consumed here; callers never see them.
    pub async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::anyhow!("WebSocket read error: {e}"))),
            };
            return Some(Ok(match message {
                tungstenite::Message::Text(text) => WsMessage::Text(text.to_string()),
                tungstenite::Message::Binary(data) => WsMessage::Binary(data.to_vec()),
                tungstenite::Message::Ping(data) => WsMessage::Ping(data.to_vec()),
                tungstenite::Message::Close(frame) => {
                    let (code, reason) = frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    WsMessage::Close { code, reason }
                }
                tungstenite::Message::Pong(_) | tungstenite::Message::Frame(_) => continue,
            }));
        }
    }
}

/// Open a WebSocket to `url` and split it into writer and reader halves.
///
/// Resolves once the handshake completes, which is the point the connection
/// is considered open.
pub async fn connect(url: &str) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();
    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Convert an HTTP(S) URL to the WS(S) scheme; `ws://`/`wss://` pass through.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}

/// Build the socket endpoint, appending the bearer token as a query parameter.
///
/// The token is passed through as-is; validating it is the server's job.
#[must_use]
pub fn endpoint_url(url: &str, token: Option<&str>) -> String {
    let base = http_to_ws_scheme(url);
    match token {
        Some(token) if !token.is_empty() => {
            let separator = if base.contains('?') { '&' } else { '?' };
            format!("{base}{separator}token={token}")
        }
        _ => base,
    }
}
