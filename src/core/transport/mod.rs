//! Transport channel to the remote tutor.
//!
//! This module owns the persistent bidirectional connection: wire framing,
//! listener registration, reconnection with linear backoff, and the
//! WebSocket and in-process implementations.
//!
//! # Architecture
//!
//! - [`Transport`] trait for connection abstraction
//! - [`WireFrame`] tagged variant for everything on the wire
//! - [`ReconnectPolicy`] plus [`RetryTimer`] for cancellable backoff
//!
//! # Example
//!
//! ```rust,ignore
//! use tutor_live::core::transport::{Handshake, Transport, TransportConfig, WebSocketTransport};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() {
//!     let transport = WebSocketTransport::new(TransportConfig::new("wss://tutor.example.com/live"));
//!     let _sub = transport.on_frame(Arc::new(|frame| println!("{}", frame.kind())));
//!     transport.connect(Handshake::new("You are a friendly barista.")).await.unwrap();
//! }
//! ```

mod base;
mod channel;
mod frame;
mod loopback;
mod reconnect;

pub use base::{
    ConnectionInfo, ConnectionState, FrameHandler, Listeners, StatusHandler, Subscription,
    Transport, TransportEvent,
};
pub use channel::{
    DEFAULT_CHANNEL_CAPACITY, HandshakeMode, INSTRUCTIONS_QUERY_PARAM, TransportConfig,
    WebSocketTransport,
};
pub use frame::{
    AudioFrame, CallStatus, ControlCommand, FunctionCallFrame, FunctionResultFrame, Handshake,
    PCM_MIME_PREFIX, Speaker, TextFrame, ToolDeclaration, WireFrame, lenient_id,
};
pub use loopback::LoopbackTransport;
pub use reconnect::{
    DEFAULT_BASE_DELAY_MS, DEFAULT_MAX_ATTEMPTS, ReconnectPolicy, ReconnectionConfig, RetryTimer,
};
