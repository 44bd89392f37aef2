//! Base trait and shared types for tutoring transports.
//!
//! A transport owns at most one live connection at a time, turns inbound
//! messages into [`WireFrame`]s and hands them to registered listeners in
//! arrival order. Listeners run synchronously on the transport's reader task,
//! so they must only enqueue work, never block.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::frame::{Handshake, WireFrame};
use crate::errors::{TutorError, TutorResult};

// =============================================================================
// Connection
// =============================================================================

/// Lifecycle of a single connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Socket is being opened
    #[default]
    Connecting,
    /// Socket is open and frames flow
    Open,
    /// Connection dropped, a retry is scheduled
    Reconnecting,
    /// Closed on request
    Closed,
    /// Gave up after exhausting retries
    Failed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "Connecting"),
            ConnectionState::Open => write!(f, "Open"),
            ConnectionState::Reconnecting => write!(f, "Reconnecting"),
            ConnectionState::Closed => write!(f, "Closed"),
            ConnectionState::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of the current connection.
///
/// A new `id` is issued for every socket; reconnecting never reuses one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Process-local connection id
    pub id: u64,
    /// Connection state
    pub state: ConnectionState,
    /// Reconnection attempts made since the last successful open
    pub attempt: u32,
    /// Last transport error seen on this connection
    pub last_error: Option<String>,
}

/// Lifecycle notifications emitted by a transport.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// A socket opened
    Opened {
        /// Id of the new connection
        connection_id: u64,
        /// Whether this open followed an unexpected drop
        reconnected: bool,
    },
    /// The connection dropped and a retry is scheduled
    Reconnecting {
        /// 1-based attempt number
        attempt: u32,
        /// Delay before the attempt
        delay_ms: u64,
    },
    /// Retries are exhausted
    Failed {
        /// Terminal error
        error: TutorError,
        /// Attempts made
        attempts: u32,
    },
    /// The caller closed the transport
    Closed,
}

// =============================================================================
// Listeners
// =============================================================================

/// Callback type for inbound frames.
pub type FrameHandler = Arc<dyn Fn(WireFrame) + Send + Sync>;

/// Callback type for transport lifecycle events.
pub type StatusHandler = Arc<dyn Fn(TransportEvent) + Send + Sync>;

/// Registry of listeners for one event type.
pub struct Listeners<E> {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, Arc<dyn Fn(E) + Send + Sync>)>>,
}

impl<E: Clone + 'static> Listeners<E> {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register a listener, returning its id.
    pub fn add(&self, handler: Arc<dyn Fn(E) + Send + Sync>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries.lock().push((id, handler));
        id
    }

    /// Remove a listener by id.
    pub fn remove(&self, id: u64) {
        self.entries.lock().retain(|(entry, _)| *entry != id);
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    /// Number of registered listeners.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Whether no listener is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener.
    ///
    /// The list is snapshotted first so a listener may unsubscribe itself.
    pub fn emit(&self, event: E) {
        let handlers: Vec<_> = self
            .entries
            .lock()
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event.clone());
        }
    }
}

impl<E: Clone + 'static> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by listener registration.
///
/// Dropping it keeps the listener registered; call [`Subscription::unsubscribe`]
/// to remove it.
#[must_use = "keep the subscription to be able to unsubscribe"]
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Subscription backed by a listener registry.
    pub fn new<E: Clone + 'static>(listeners: &Arc<Listeners<E>>, id: u64) -> Self
    where
        Listeners<E>: Send + Sync,
    {
        let weak = Arc::downgrade(listeners);
        Self {
            cancel: Some(Box::new(move || {
                if let Some(listeners) = weak.upgrade() {
                    listeners.remove(id);
                }
            })),
        }
    }

    /// Remove the listener.
    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

// =============================================================================
// Base Trait
// =============================================================================

/// Persistent bidirectional channel to the remote tutor.
///
/// # Contract
///
/// - `connect` resolves once the socket is open and fails with
///   [`TutorError::ConnectionFailed`] if it errors first.
/// - `send` fails fast with [`TutorError::NotConnected`] while offline. Frames
///   are never queued across a reconnect.
/// - Unexpected drops trigger reconnection with linear backoff; `disconnect`
///   suppresses it, cancels any pending retry and clears every listener.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and deliver the handshake.
    async fn connect(&self, handshake: Handshake) -> TutorResult<()>;

    /// Send one frame.
    fn send(&self, frame: WireFrame) -> TutorResult<()>;

    /// Register a listener for inbound frames.
    fn on_frame(&self, handler: FrameHandler) -> Subscription;

    /// Register a listener for lifecycle events.
    fn on_status(&self, handler: StatusHandler) -> Subscription;

    /// Close the connection on purpose.
    fn disconnect(&self);

    /// Whether a connection is currently open.
    fn is_connected(&self) -> bool;

    /// Snapshot of the current connection, if one was ever opened.
    fn connection(&self) -> Option<ConnectionInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_listeners_emit_and_unsubscribe() {
        let listeners: Arc<Listeners<u32>> = Arc::new(Listeners::new());
        let total = Arc::new(AtomicUsize::new(0));

        let counter = total.clone();
        let id = listeners.add(Arc::new(move |value: u32| {
            counter.fetch_add(value as usize, Ordering::SeqCst);
        }));
        let subscription = Subscription::new(&listeners, id);

        listeners.emit(2);
        listeners.emit(3);
        assert_eq!(total.load(Ordering::SeqCst), 5);

        subscription.unsubscribe();
        listeners.emit(10);
        assert_eq!(total.load(Ordering::SeqCst), 5);
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_listeners_clear() {
        let listeners: Listeners<()> = Listeners::new();
        listeners.add(Arc::new(|_: ()| {}));
        listeners.add(Arc::new(|_: ()| {}));
        assert_eq!(listeners.len(), 2);

        listeners.clear();
        assert!(listeners.is_empty());
    }

    #[test]
    fn test_unsubscribe_after_registry_dropped() {
        let listeners: Arc<Listeners<()>> = Arc::new(Listeners::new());
        let id = listeners.add(Arc::new(|_: ()| {}));
        let subscription = Subscription::new(&listeners, id);
        drop(listeners);

        subscription.unsubscribe();
    }

    #[test]
    fn test_connection_state_display() {
        assert_eq!(ConnectionState::Open.to_string(), "Open");
        assert_eq!(ConnectionState::Reconnecting.to_string(), "Reconnecting");
        assert_eq!(ConnectionState::Failed.to_string(), "Failed");
    }
}
