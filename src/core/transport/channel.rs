//! WebSocket transport to the remote tutor.
//!
//! This module provides [`WebSocketTransport`], the production implementation of
//! [`Transport`] on top of `tokio-tungstenite`.
//!
//! # Connection model
//!
//! - Endpoint: any `ws://` or `wss://` URL, optionally authenticated with a
//!   bearer token
//! - Protocol: one JSON frame per text message (see [`WireFrame`]); binary
//!   messages are treated as raw PCM at the output sample rate
//! - Handshake: a `setup` frame sent first on every open, or an `instructions`
//!   query parameter, depending on [`HandshakeMode`]
//!
//! A single supervisor task owns the socket. It drains the outbound queue,
//! parses inbound messages and, after an unexpected drop, runs the linear
//! backoff schedule from [`ReconnectPolicy`]. Each successful reconnect builds
//! a brand new socket and outbound queue; nothing queued for the old socket
//! is replayed on the new one.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use http::HeaderValue;
use http::header::AUTHORIZATION;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::base::{
    ConnectionInfo, ConnectionState, FrameHandler, Listeners, StatusHandler, Subscription,
    Transport, TransportEvent,
};
use super::frame::{AudioFrame, Handshake, PCM_MIME_PREFIX, WireFrame};
use super::reconnect::{ReconnectPolicy, ReconnectionConfig, RetryTimer};
use crate::errors::{TutorError, TutorResult};

/// Default capacity of the outbound frame queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Query parameter carrying the instructions in [`HandshakeMode::Query`].
pub const INSTRUCTIONS_QUERY_PARAM: &str = "instructions";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// How the handshake payload reaches the tutor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HandshakeMode {
    /// `setup` frame sent before any other frame on each connection
    #[default]
    FirstFrame,
    /// Instructions appended to the endpoint URI
    Query,
}

impl std::str::FromStr for HandshakeMode {
    type Err = TutorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "first_frame" | "first-frame" | "frame" => Ok(HandshakeMode::FirstFrame),
            "query" => Ok(HandshakeMode::Query),
            other => Err(TutorError::InvalidConfiguration(format!(
                "unknown handshake mode '{other}'"
            ))),
        }
    }
}

/// Settings for [`WebSocketTransport`].
#[derive(Debug, Clone, PartialEq)]
pub struct TransportConfig {
    /// WebSocket endpoint
    pub endpoint: String,
    /// Optional bearer token
    pub api_key: Option<String>,
    /// Handshake delivery
    pub handshake_mode: HandshakeMode,
    /// Reconnection after unexpected drops
    pub reconnection: ReconnectionConfig,
    /// Outbound queue capacity
    pub channel_capacity: usize,
    /// Sample rate of outbound (microphone) audio
    pub input_sample_rate: u32,
    /// Sample rate of inbound (tutor) audio
    pub output_sample_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            api_key: None,
            handshake_mode: HandshakeMode::default(),
            reconnection: ReconnectionConfig::default(),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            input_sample_rate: 16000,
            output_sample_rate: 24000,
        }
    }
}

impl TransportConfig {
    /// Config for an endpoint with every other setting at its default.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            ..Default::default()
        }
    }

    /// Mime type of outbound audio.
    pub fn input_mime(&self) -> String {
        format!("{PCM_MIME_PREFIX};rate={}", self.input_sample_rate)
    }

    /// Mime type of inbound audio.
    pub fn output_mime(&self) -> String {
        format!("{PCM_MIME_PREFIX};rate={}", self.output_sample_rate)
    }

    /// Endpoint URL with the handshake applied.
    pub fn build_url(&self, handshake: &Handshake) -> TutorResult<Url> {
        let mut url = Url::parse(&self.endpoint).map_err(|e| {
            TutorError::InvalidConfiguration(format!("invalid endpoint '{}': {e}", self.endpoint))
        })?;
        if self.handshake_mode == HandshakeMode::Query {
            url.query_pairs_mut()
                .append_pair(INSTRUCTIONS_QUERY_PARAM, &handshake.instructions);
        }
        Ok(url)
    }
}

// =============================================================================
// Shared state
// =============================================================================

struct Shared {
    config: TransportConfig,
    connected: AtomicBool,
    intentional_disconnect: AtomicBool,
    sender: Mutex<Option<mpsc::Sender<Message>>>,
    frames: Arc<Listeners<WireFrame>>,
    status: Arc<Listeners<TransportEvent>>,
    info: Mutex<Option<ConnectionInfo>>,
    next_connection_id: AtomicU64,
    task: Mutex<Option<JoinHandle<()>>>,
    cancel: Mutex<CancellationToken>,
}

impl Shared {
    /// Register a freshly opened socket and return its connection id.
    fn mark_open(&self, sender: mpsc::Sender<Message>) -> u64 {
        let id = self.next_connection_id.fetch_add(1, Ordering::SeqCst);
        *self.sender.lock() = Some(sender);
        *self.info.lock() = Some(ConnectionInfo {
            id,
            state: ConnectionState::Open,
            attempt: 0,
            last_error: None,
        });
        self.connected.store(true, Ordering::SeqCst);
        id
    }

    fn mark_down(&self) {
        self.connected.store(false, Ordering::SeqCst);
        *self.sender.lock() = None;
    }

    fn update_info(&self, state: ConnectionState, attempt: u32, error: Option<String>) {
        let mut info = self.info.lock();
        if let Some(info) = info.as_mut() {
            info.state = state;
            info.attempt = attempt;
            if error.is_some() {
                info.last_error = error;
            }
        }
    }

    fn connection_id(&self) -> u64 {
        self.info.lock().as_ref().map(|info| info.id).unwrap_or_default()
    }

    fn deliver_text(&self, text: &str) {
        match WireFrame::parse(text) {
            Ok(frame) => {
                debug!(kind = frame.kind(), "Inbound frame");
                self.frames.emit(frame);
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed frame");
            }
        }
    }
}

// =============================================================================
// WebSocketTransport
// =============================================================================

/// Transport over a single WebSocket connection with automatic reconnection.
///
/// # Thread Safety
///
/// All state lives behind an `Arc` shared with the supervisor task, so the
/// transport can be used from any thread. `send` never awaits; it pushes onto
/// a bounded queue and fails when the queue is full or the socket is down.
pub struct WebSocketTransport {
    shared: Arc<Shared>,
}

impl WebSocketTransport {
    /// Create a transport. No connection is made until [`Transport::connect`].
    pub fn new(config: TransportConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                connected: AtomicBool::new(false),
                intentional_disconnect: AtomicBool::new(false),
                sender: Mutex::new(None),
                frames: Arc::new(Listeners::new()),
                status: Arc::new(Listeners::new()),
                info: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                task: Mutex::new(None),
                cancel: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Transport configuration.
    pub fn config(&self) -> &TransportConfig {
        &self.shared.config
    }

    /// Stop any previous supervisor task before a new connection is built.
    fn teardown_previous(&self) {
        self.shared.cancel.lock().cancel();
        if let Some(handle) = self.shared.task.lock().take() {
            handle.abort();
        }
        self.shared.mark_down();
    }
}

/// Open a socket and deliver the handshake.
async fn open_socket(
    config: &TransportConfig,
    handshake: &Handshake,
) -> TutorResult<(WsSink, WsSource)> {
    let url = config.build_url(handshake)?;

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| TutorError::ConnectionFailed(e.to_string()))?;
    if let Some(key) = config.api_key.as_deref() {
        let value = HeaderValue::from_str(&format!("Bearer {key}"))
            .map_err(|e| TutorError::InvalidConfiguration(format!("invalid API key: {e}")))?;
        request.headers_mut().insert(AUTHORIZATION, value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TutorError::ConnectionFailed(e.to_string()))?;
    let (mut sink, stream) = ws_stream.split();

    if config.handshake_mode == HandshakeMode::FirstFrame {
        let setup = handshake.to_setup_json(&config.input_mime(), &config.output_mime())?;
        sink.send(Message::Text(setup.into()))
            .await
            .map_err(|e| TutorError::ConnectionFailed(format!("handshake failed: {e}")))?;
    }

    Ok((sink, stream))
}

/// Supervisor loop: pump frames, then reconnect after unexpected drops.
async fn supervise(
    shared: Arc<Shared>,
    handshake: Handshake,
    mut sink: WsSink,
    mut stream: WsSource,
    mut rx: mpsc::Receiver<Message>,
    token: CancellationToken,
) {
    let timer = RetryTimer::new(token.clone());
    let mut policy = ReconnectPolicy::new(shared.config.reconnection.clone());

    'outer: loop {
        let connection_id = shared.connection_id();
        let mut drop_reason: Option<String> = None;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    // Frames queued before disconnect() still go out
                    while let Ok(message) = rx.try_recv() {
                        if let Err(e) = sink.send(message).await {
                            debug!(connection_id, "Queued frame not delivered: {}", e);
                            break;
                        }
                    }
                    if let Err(e) = sink.send(Message::Close(None)).await {
                        debug!(connection_id, "Close frame not delivered: {}", e);
                    }
                    break 'outer;
                }

                outbound = rx.recv() => match outbound {
                    Some(message) => {
                        if let Err(e) = sink.send(message).await {
                            error!(connection_id, "Failed to send WebSocket message: {}", e);
                            drop_reason = Some(e.to_string());
                            break;
                        }
                    }
                    None => break,
                },

                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Text(text))) => shared.deliver_text(text.as_str()),
                    Some(Ok(Message::Binary(data))) => {
                        let frame = AudioFrame {
                            payload: data,
                            mime: shared.config.output_mime(),
                        };
                        shared.frames.emit(WireFrame::Audio(frame));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if let Err(e) = sink.send(Message::Pong(data)).await {
                            error!(connection_id, "Failed to send pong: {}", e);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        info!(connection_id, ?frame, "WebSocket closed by server");
                        drop_reason = Some("closed by server".to_string());
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        error!(connection_id, "WebSocket error: {}", e);
                        drop_reason = Some(e.to_string());
                        break;
                    }
                    None => {
                        drop_reason = Some("stream ended".to_string());
                        break;
                    }
                },
            }
        }

        shared.mark_down();

        if shared.intentional_disconnect.load(Ordering::SeqCst) || token.is_cancelled() {
            info!(connection_id, "Intentional disconnect, not attempting reconnection");
            break 'outer;
        }

        let mut last_error = drop_reason;

        loop {
            let Some(delay) = policy.next_delay() else {
                let attempts = policy.attempt();
                warn!(
                    connection_id,
                    attempts, "Reconnection disabled or max attempts reached"
                );
                let error = TutorError::ConnectionFailed(format!(
                    "Connection lost after {} reconnection attempts{}",
                    attempts,
                    last_error
                        .as_deref()
                        .map(|e| format!(": {e}"))
                        .unwrap_or_default()
                ));
                shared.update_info(ConnectionState::Failed, attempts, last_error);
                shared.status.emit(TransportEvent::Failed { error, attempts });
                break 'outer;
            };

            let attempt = policy.attempt();
            let delay_ms = delay.as_millis() as u64;
            info!(connection_id, attempt, delay_ms, "Scheduling reconnection");
            shared.update_info(ConnectionState::Reconnecting, attempt, last_error.clone());
            shared
                .status
                .emit(TransportEvent::Reconnecting { attempt, delay_ms });

            if !timer.wait(delay).await {
                info!(connection_id, "Reconnection cancelled");
                break 'outer;
            }

            match open_socket(&shared.config, &handshake).await {
                Ok((new_sink, new_stream)) => {
                    if token.is_cancelled() {
                        break 'outer;
                    }
                    let (tx, new_rx) = mpsc::channel(shared.config.channel_capacity.max(1));
                    sink = new_sink;
                    stream = new_stream;
                    rx = new_rx;

                    let id = shared.mark_open(tx);
                    policy.reset();
                    info!(connection_id = id, attempt, "Reconnected");
                    shared.status.emit(TransportEvent::Opened {
                        connection_id: id,
                        reconnected: true,
                    });
                    continue 'outer;
                }
                Err(e) => {
                    warn!(connection_id, attempt, "Reconnection attempt failed: {}", e);
                    last_error = Some(e.to_string());
                }
            }
        }
    }

    // A cancelled token means a newer connection may already own the state
    if !token.is_cancelled() {
        shared.mark_down();
    }
    debug!("Transport supervisor ended");
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(&self, handshake: Handshake) -> TutorResult<()> {
        self.teardown_previous();
        self.shared
            .intentional_disconnect
            .store(false, Ordering::SeqCst);

        let token = CancellationToken::new();
        *self.shared.cancel.lock() = token.clone();

        info!(endpoint = %self.shared.config.endpoint, "Connecting to tutor");
        let (sink, stream) = open_socket(&self.shared.config, &handshake).await?;

        // disconnect() may have run while the socket was opening
        if token.is_cancelled() {
            return Err(TutorError::ConnectionFailed(
                "disconnected while connecting".to_string(),
            ));
        }

        let (tx, rx) = mpsc::channel(self.shared.config.channel_capacity.max(1));
        let connection_id = self.shared.mark_open(tx);
        info!(connection_id, "Connected to tutor");

        // Listeners hear Opened before the reader can deliver any frame
        self.shared.status.emit(TransportEvent::Opened {
            connection_id,
            reconnected: false,
        });

        let handle = tokio::spawn(supervise(
            self.shared.clone(),
            handshake,
            sink,
            stream,
            rx,
            token,
        ));
        *self.shared.task.lock() = Some(handle);
        Ok(())
    }

    fn send(&self, frame: WireFrame) -> TutorResult<()> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(TutorError::NotConnected);
        }
        let json = frame.to_json()?;

        let sender = self.shared.sender.lock();
        let Some(tx) = sender.as_ref() else {
            return Err(TutorError::NotConnected);
        };
        tx.try_send(Message::Text(json.into()))
            .map_err(|e| match e {
                TrySendError::Full(_) => {
                    TutorError::WebSocketError("outbound queue is full".to_string())
                }
                TrySendError::Closed(_) => TutorError::NotConnected,
            })
    }

    fn on_frame(&self, handler: FrameHandler) -> Subscription {
        let id = self.shared.frames.add(handler);
        Subscription::new(&self.shared.frames, id)
    }

    fn on_status(&self, handler: StatusHandler) -> Subscription {
        let id = self.shared.status.add(handler);
        Subscription::new(&self.shared.status, id)
    }

    fn disconnect(&self) {
        self.shared
            .intentional_disconnect
            .store(true, Ordering::SeqCst);
        self.shared.cancel.lock().cancel();
        self.shared.mark_down();

        let had_connection = self.shared.info.lock().is_some();
        self.shared
            .update_info(ConnectionState::Closed, 0, None);
        if had_connection {
            info!("Disconnected from tutor");
            self.shared.status.emit(TransportEvent::Closed);
        }

        self.shared.frames.clear();
        self.shared.status.clear();
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Option<ConnectionInfo> {
        self.shared.info.lock().clone()
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.shared.cancel.lock().cancel();
        if let Some(handle) = self.shared.task.lock().take() {
            handle.abort();
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
