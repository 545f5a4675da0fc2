//! The channel client: connection lifecycle, join/leave, push and dispatch.
//!
//! `Socket` is a cheap cloneable handle. All shared state sits behind one
//! mutex that is never held across an `.await` or while user callbacks run.
//! Each open connection is served by one background task that owns both the
//! reader and the writer, so inbound frames are dispatched strictly in the
//! order the transport delivers them.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::correlation::{CorrelationTable, PendingKind};
use super::dispatcher::{self, Dispatch};
use super::frame::{Frame, MessageRef, ReplyStatus, JOIN_EVENT, LEAVE_EVENT};
use super::registry::TopicRegistry;
use super::{ChannelError, ConnectionState};
use crate::config::SocketConfig;
use crate::ws::{self, WsMessage, WsReader, WsWriter};

/// How often the connection loop drops pending entries nobody awaits anymore.
const ABANDONED_SWEEP_INTERVAL: Duration = Duration::from_secs(5);

/// How long a retired connection gets to send its close frame.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

/// Command for the connection loop's writer.
#[derive(Debug)]
enum Outbound {
    /// One encoded frame.
    Text(String),
    /// Send a close frame and stop.
    Close,
}

/// A connection taken out of service, still to be shut down.
#[derive(Debug)]
struct Retired {
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
}

impl Retired {
    async fn shutdown(self) {
        if let Some(tx) = self.outbound_tx {
            let _ = tx.send(Outbound::Close);
        }
        if let Some(task) = self.task {
            let abort = task.abort_handle();
            if tokio::time::timeout(CLOSE_TIMEOUT, task).await.is_err() {
                log::warn!("[Socket] Connection task did not stop in time, aborting");
                abort.abort();
            }
        }
    }
}

/// Mutable socket state.
#[derive(Debug, Default)]
struct SocketInner {
    state: ConnectionState,
    /// Bumped on every connect and teardown. A connection loop only touches
    /// state while its own generation is current.
    generation: u64,
    outbound_tx: Option<mpsc::UnboundedSender<Outbound>>,
    task: Option<JoinHandle<()>>,
    registry: TopicRegistry,
    correlation: CorrelationTable,
}

impl SocketInner {
    /// Queue a frame for the writer.
    fn send(&self, frame: &Frame) -> Result<(), ChannelError> {
        if self.state != ConnectionState::Open {
            return Err(ChannelError::NotConnected);
        }
        let tx = self.outbound_tx.as_ref().ok_or(ChannelError::NotConnected)?;
        let text = frame.encode()?;
        tx.send(Outbound::Text(text))
            .map_err(|_| ChannelError::Closed)
    }

    /// Queue a frame, dropping it with a debug log when the socket is not open.
    fn send_or_drop(&self, frame: &Frame) {
        if let Err(e) = self.send(frame) {
            log::debug!(
                "[Socket] Dropped {} on {} (ref {:?}): {e}",
                frame.event,
                frame.topic,
                frame.reference.as_ref().map(MessageRef::as_str)
            );
        }
    }

    /// Invalidate the current connection and forget its topics and pending
    /// requests. Waiters on those requests observe [`ChannelError::Closed`].
    fn teardown(&mut self, next: ConnectionState) -> Retired {
        self.generation += 1;
        self.state = next;
        self.registry.clear();
        self.correlation.clear();
        Retired {
            outbound_tx: self.outbound_tx.take(),
            task: self.task.take(),
        }
    }
}

#[derive(Debug)]
struct Shared {
    config: SocketConfig,
    inner: Mutex<SocketInner>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, SocketInner> {
        // Callbacks never run under this lock, so a poisoned guard still
        // protects consistent tables.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Decode and dispatch one inbound text message.
    fn handle_text(&self, generation: u64, text: &str) {
        let frame = match Frame::decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                let preview: String = text.chars().take(100).collect();
                log::warn!("[Socket] {e}: {preview}");
                return;
            }
        };
        let (topic, event) = (frame.topic.clone(), frame.event.clone());

        let dispatch = {
            let mut guard = self.lock();
            if guard.generation != generation {
                return;
            }
            let inner = &mut *guard;
            dispatcher::route(&mut inner.registry, &mut inner.correlation, frame)
        };

        match dispatch {
            Dispatch::Replied { reference, joined } => {
                log::debug!("[Socket] Reply for ref {reference} on {topic}");
                if let Some(topic) = joined {
                    log::info!("[Socket] Joined {topic}");
                }
            }
            Dispatch::Deliver { callbacks, payload } => {
                let failures = dispatcher::invoke(&callbacks, &payload);
                log::trace!(
                    "[Socket] Delivered {event} on {topic} to {} callbacks ({failures} failed)",
                    callbacks.len()
                );
            }
            Dispatch::Dropped(reason) => {
                log::trace!("[Socket] Dropped {event} on {topic}: {reason:?}");
            }
        }
    }
}

/// Client for a topic-multiplexed channel socket.
///
/// Clones share one connection, one topic registry, and one ref counter.
#[derive(Debug, Clone)]
pub struct Socket {
    shared: Arc<Shared>,
}

/// Builder for [`Socket`].
#[derive(Debug, Clone)]
pub struct SocketBuilder {
    config: SocketConfig,
}

impl SocketBuilder {
    /// Bearer token sent as the `token` query parameter.
    #[must_use]
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.token = Some(token.into());
        self
    }

    /// Override the join reply window (10 seconds by default).
    #[must_use]
    pub fn join_timeout(mut self, timeout: Duration) -> Self {
        self.config.join_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Override the request reply window.
    #[must_use]
    pub fn reply_timeout(mut self, timeout: Duration) -> Self {
        self.config.reply_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Build the socket. Nothing is connected yet.
    #[must_use]
    pub fn build(self) -> Socket {
        Socket::new(self.config)
    }
}

impl Socket {
    /// Start building a socket for `url`.
    #[must_use]
    pub fn builder(url: impl Into<String>) -> SocketBuilder {
        SocketBuilder {
            config: SocketConfig::new(url),
        }
    }

    /// Create a disconnected socket from a config.
    #[must_use]
    pub fn new(config: SocketConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(SocketInner::default()),
            }),
        }
    }

    /// The config this socket was built with.
    #[must_use]
    pub fn config(&self) -> &SocketConfig {
        &self.shared.config
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.shared.lock().state
    }

    /// Open the connection.
    ///
    /// Any connection already open is closed first, and its topics and
    /// pending requests are dropped. Resolves once the WebSocket handshake
    /// completes.
    pub async fn connect(&self) -> Result<(), ChannelError> {
        let (generation, retired) = {
            let mut inner = self.shared.lock();
            let retired = inner.teardown(ConnectionState::Connecting);
            (inner.generation, retired)
        };
        retired.shutdown().await;

        let config = &self.shared.config;
        let url = ws::endpoint_url(&config.url, config.token.as_deref());
        log::info!("[Socket] Connecting to {}", config.url);

        let (writer, reader) = match ws::connect(&url).await {
            Ok(pair) => pair,
            Err(e) => {
                let mut inner = self.shared.lock();
                if inner.generation == generation {
                    inner.state = ConnectionState::Disconnected;
                }
                log::warn!("[Socket] Connection failed: {e:#}");
                return Err(ChannelError::ConnectionFailed(format!("{e:#}")));
            }
        };

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let mut inner = self.shared.lock();
        if inner.generation != generation {
            // A disconnect or newer connect superseded this attempt; the
            // dropped halves close the transport.
            return Err(ChannelError::ConnectionFailed(
                "superseded by a newer connect or disconnect".to_string(),
            ));
        }
        inner.state = ConnectionState::Open;
        inner.outbound_tx = Some(outbound_tx);
        inner.task = Some(tokio::spawn(run_connection_loop(
            Arc::downgrade(&self.shared),
            generation,
            writer,
            reader,
            outbound_rx,
        )));
        log::info!("[Socket] Connected");
        Ok(())
    }

    /// Close the connection. Safe to call when already closed.
    ///
    /// Joined topics and pending requests are dropped.
    pub async fn disconnect(&self) {
        let retired = {
            let mut inner = self.shared.lock();
            if inner.state == ConnectionState::Closed && inner.task.is_none() {
                return;
            }
            inner.teardown(ConnectionState::Closed)
        };
        retired.shutdown().await;
        log::info!("[Socket] Disconnected");
    }

    /// Join `topic`, resolving with the reply's response body.
    ///
    /// The topic is registered when the success reply is dispatched, so
    /// callbacks registered before this resolves are ignored.
    pub async fn join(&self, topic: &str) -> Result<Value, ChannelError> {
        let (reference, mut reply_rx) = {
            let mut inner = self.shared.lock();
            let reference = inner.correlation.next_ref();
            let reply_rx = inner.correlation.insert(
                reference.clone(),
                PendingKind::Join {
                    topic: topic.to_string(),
                },
            );
            inner.send_or_drop(&Frame::outbound(topic, JOIN_EVENT, json!({}), reference.clone()));
            (reference, reply_rx)
        };
        log::debug!("[Socket] Joining {topic} (ref {reference})");

        let payload = self
            .await_reply(&reference, &mut reply_rx, self.shared.config.join_timeout())
            .await
            .map_err(|e| match e {
                ChannelError::ReplyTimeout { .. } => {
                    log::warn!("[Socket] Join {topic} timed out");
                    ChannelError::JoinTimeout {
                        topic: topic.to_string(),
                    }
                }
                other => other,
            })?;

        match ReplyStatus::from_payload(payload) {
            ReplyStatus::Ok(response) => Ok(response),
            ReplyStatus::Error(reason) => {
                log::warn!("[Socket] Join {topic} rejected: {reason}");
                Err(ChannelError::JoinRejected {
                    topic: topic.to_string(),
                    reason,
                })
            }
        }
    }

    /// Leave `topic`: send a leave frame without awaiting a reply, and drop
    /// the topic and its callbacks immediately.
    pub fn leave(&self, topic: &str) {
        let mut inner = self.shared.lock();
        let reference = inner.correlation.next_ref();
        inner.send_or_drop(&Frame::outbound(topic, LEAVE_EVENT, json!({}), reference));
        if inner.registry.remove(topic) {
            log::info!("[Socket] Left {topic}");
        }
    }

    /// Register `callback` for `event` on a joined `topic`.
    ///
    /// Does nothing if `topic` is not joined.
    pub fn on<F>(&self, topic: &str, event: &str, callback: F)
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if !self
            .shared
            .lock()
            .registry
            .register(topic, event, Arc::new(callback))
        {
            log::debug!("[Socket] Ignoring {event} callback for unjoined topic {topic}");
        }
    }

    /// Register a callback over a typed payload.
    ///
    /// Payloads that do not decode as `T` are logged and skipped for this
    /// callback only.
    pub fn on_typed<T, F>(&self, topic: &str, event: &str, callback: F)
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let label = format!("{topic}/{event}");
        self.on(topic, event, move |payload| match T::deserialize(payload) {
            Ok(value) => callback(value),
            Err(e) => log::warn!("[Socket] Undecodable payload for {label}: {e}"),
        });
    }

    /// Send a frame, returning the ref used (`reference` or a fresh one).
    ///
    /// When the socket is not open the frame is dropped and only a debug
    /// line is logged. Use [`Self::try_push`] to get an error instead.
    pub fn push(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
        reference: Option<MessageRef>,
    ) -> MessageRef {
        let mut inner = self.shared.lock();
        let reference = reference.unwrap_or_else(|| inner.correlation.next_ref());
        inner.send_or_drop(&Frame::outbound(topic, event, payload, reference.clone()));
        reference
    }

    /// Like [`Self::push`], but fails with [`ChannelError::NotConnected`]
    /// instead of dropping the frame.
    pub fn try_push(
        &self,
        topic: &str,
        event: &str,
        payload: Value,
        reference: Option<MessageRef>,
    ) -> Result<MessageRef, ChannelError> {
        let mut inner = self.shared.lock();
        let reference = reference.unwrap_or_else(|| inner.correlation.next_ref());
        inner.send(&Frame::outbound(topic, event, payload, reference.clone()))?;
        Ok(reference)
    }

    /// Push a frame and wait for its reply payload.
    pub async fn request(&self, topic: &str, event: &str, payload: Value) -> Result<Value, ChannelError> {
        let (reference, mut reply_rx) = {
            let mut inner = self.shared.lock();
            let reference = inner.correlation.next_ref();
            let reply_rx = inner.correlation.insert(reference.clone(), PendingKind::Request);
            if let Err(e) = inner.send(&Frame::outbound(topic, event, payload, reference.clone())) {
                inner.correlation.take(&reference);
                return Err(e);
            }
            (reference, reply_rx)
        };
        self.await_reply(&reference, &mut reply_rx, self.shared.config.reply_timeout())
            .await
    }

    /// Wait for a pending reply, evicting the entry if `window` elapses.
    async fn await_reply(
        &self,
        reference: &MessageRef,
        reply_rx: &mut oneshot::Receiver<Value>,
        window: Duration,
    ) -> Result<Value, ChannelError> {
        match tokio::time::timeout(window, &mut *reply_rx).await {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(_)) => Err(ChannelError::Closed),
            Err(_) => {
                if self.shared.lock().correlation.take(reference).is_some() {
                    return Err(ChannelError::ReplyTimeout {
                        reference: reference.clone(),
                    });
                }
                // The dispatcher took the entry first; its payload is already
                // in the channel unless a teardown dropped it.
                match reply_rx.try_recv() {
                    Ok(payload) => Ok(payload),
                    Err(_) => Err(ChannelError::Closed),
                }
            }
        }
    }

    /// Whether `topic` is currently joined.
    #[must_use]
    pub fn is_joined(&self, topic: &str) -> bool {
        self.shared.lock().registry.contains(topic)
    }

    /// Joined topics, sorted.
    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        self.shared.lock().registry.names()
    }

    /// Number of requests still awaiting a reply.
    #[must_use]
    pub fn pending_replies(&self) -> usize {
        self.shared.lock().correlation.len()
    }
}

/// How the connection loop ended.
enum LoopExit {
    /// Asked to close, or the socket was dropped.
    Shutdown,
    /// Transport closed or failed.
    Disconnected,
}

/// Serve one open connection until it closes.
///
/// Holds only a weak reference so dropping every `Socket` clone ends the
/// loop: the outbound sender goes away and the writer closes.
async fn run_connection_loop(
    shared: Weak<Shared>,
    generation: u64,
    mut writer: WsWriter,
    mut reader: WsReader,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    let mut sweep = tokio::time::interval(ABANDONED_SWEEP_INTERVAL);
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    let exit = loop {
        tokio::select! {
            incoming = reader.recv() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let Some(shared) = shared.upgrade() else {
                        break LoopExit::Shutdown;
                    };
                    shared.handle_text(generation, &text);
                }
                Some(Ok(WsMessage::Binary(data))) => {
                    log::debug!("[Socket] Ignoring {}-byte binary message", data.len());
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = writer.send_pong(data).await {
                        log::warn!("[Socket] {e:#}");
                        break LoopExit::Disconnected;
                    }
                }
                Some(Ok(WsMessage::Close { code, reason })) => {
                    log::info!("[Socket] Closed by remote ({code}) {reason}");
                    break LoopExit::Disconnected;
                }
                Some(Err(e)) => {
                    log::warn!("[Socket] {e:#}");
                    break LoopExit::Disconnected;
                }
                None => {
                    log::info!("[Socket] Stream ended");
                    break LoopExit::Disconnected;
                }
            },

            outbound = outbound_rx.recv() => match outbound {
                Some(Outbound::Text(text)) => {
                    if let Err(e) = writer.send_text(text).await {
                        log::warn!("[Socket] {e:#}");
                        break LoopExit::Disconnected;
                    }
                }
                Some(Outbound::Close) | None => {
                    if let Err(e) = writer.close().await {
                        log::debug!("[Socket] {e:#}");
                    }
                    break LoopExit::Shutdown;
                }
            },

            _ = sweep.tick() => {
                let Some(shared) = shared.upgrade() else {
                    break LoopExit::Shutdown;
                };
                let mut inner = shared.lock();
                if inner.generation == generation {
                    let evicted = inner.correlation.evict_abandoned();
                    if evicted > 0 {
                        log::debug!("[Socket] Evicted {evicted} abandoned pending replies");
                    }
                }
            }
        }
    };

    if let LoopExit::Disconnected = exit {
        if let Some(shared) = shared.upgrade() {
            let mut inner = shared.lock();
            if inner.generation == generation {
                // The retired task handle is this task; dropping it detaches.
                drop(inner.teardown(ConnectionState::Closed));
            }
        }
    }
}
