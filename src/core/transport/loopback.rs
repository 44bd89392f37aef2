//! In-process transport.
//!
//! [`LoopbackTransport`] implements [`Transport`] without a socket. Inbound
//! frames are injected with [`LoopbackTransport::deliver`], outbound frames are
//! recorded, and drops or connect failures can be simulated. Clones share the
//! same connection, so a test can keep one handle while the session owns
//! another.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::warn;

use super::base::{
    ConnectionInfo, ConnectionState, FrameHandler, Listeners, StatusHandler, Subscription,
    Transport, TransportEvent,
};
use super::frame::{Handshake, WireFrame};
use crate::errors::{TutorError, TutorResult};

struct Inner {
    connected: AtomicBool,
    failures_pending: AtomicU32,
    sent: Mutex<Vec<WireFrame>>,
    handshakes: Mutex<Vec<Handshake>>,
    frames: Arc<Listeners<WireFrame>>,
    status: Arc<Listeners<TransportEvent>>,
    info: Mutex<Option<ConnectionInfo>>,
    next_connection_id: AtomicU64,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

/// Transport that loops frames through memory.
#[derive(Clone)]
pub struct LoopbackTransport {
    inner: Arc<Inner>,
}

impl Default for LoopbackTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackTransport {
    /// Disconnected loopback.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                connected: AtomicBool::new(false),
                failures_pending: AtomicU32::new(0),
                sent: Mutex::new(Vec::new()),
                handshakes: Mutex::new(Vec::new()),
                frames: Arc::new(Listeners::new()),
                status: Arc::new(Listeners::new()),
                info: Mutex::new(None),
                next_connection_id: AtomicU64::new(1),
                connects: AtomicUsize::new(0),
                disconnects: AtomicUsize::new(0),
            }),
        }
    }

    /// Make the next `count` calls to `connect` fail.
    pub fn fail_next_connects(&self, count: u32) {
        self.inner.failures_pending.store(count, Ordering::SeqCst);
    }

    /// Deliver an inbound frame to every frame listener.
    pub fn deliver(&self, frame: WireFrame) {
        self.inner.frames.emit(frame);
    }

    /// Deliver a raw text message, dropping it if it does not parse.
    pub fn deliver_raw(&self, text: &str) {
        match WireFrame::parse(text) {
            Ok(frame) => self.deliver(frame),
            Err(e) => warn!(error = %e, "Dropping malformed frame"),
        }
    }

    /// Simulate an unexpected drop. No reconnection is scheduled; use
    /// [`LoopbackTransport::emit_status`] to play out a retry sequence.
    pub fn drop_connection(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        if let Some(info) = self.inner.info.lock().as_mut() {
            info.state = ConnectionState::Reconnecting;
        }
    }

    /// Re-open after a simulated drop, as a successful reconnect would.
    pub fn restore_connection(&self) {
        let id = self.open();
        self.inner.status.emit(TransportEvent::Opened {
            connection_id: id,
            reconnected: true,
        });
    }

    /// Emit a lifecycle event to every status listener.
    pub fn emit_status(&self, event: TransportEvent) {
        if let TransportEvent::Failed { .. } = event {
            self.inner.connected.store(false, Ordering::SeqCst);
            if let Some(info) = self.inner.info.lock().as_mut() {
                info.state = ConnectionState::Failed;
            }
        }
        self.inner.status.emit(event);
    }

    /// Frames sent so far.
    pub fn sent(&self) -> Vec<WireFrame> {
        self.inner.sent.lock().clone()
    }

    /// Drain the sent frames.
    pub fn take_sent(&self) -> Vec<WireFrame> {
        std::mem::take(&mut *self.inner.sent.lock())
    }

    /// Handshakes received by `connect`, successful or not.
    pub fn handshakes(&self) -> Vec<Handshake> {
        self.inner.handshakes.lock().clone()
    }

    /// Number of `connect` calls.
    pub fn connect_count(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of `disconnect` calls.
    pub fn disconnect_count(&self) -> usize {
        self.inner.disconnects.load(Ordering::SeqCst)
    }

    /// Number of registered frame listeners.
    pub fn frame_listener_count(&self) -> usize {
        self.inner.frames.len()
    }

    fn open(&self) -> u64 {
        let id = self.inner.next_connection_id.fetch_add(1, Ordering::SeqCst);
        *self.inner.info.lock() = Some(ConnectionInfo {
            id,
            state: ConnectionState::Open,
            attempt: 0,
            last_error: None,
        });
        self.inner.connected.store(true, Ordering::SeqCst);
        id
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn connect(&self, handshake: Handshake) -> TutorResult<()> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        self.inner.handshakes.lock().push(handshake);

        let failing = self
            .inner
            .failures_pending
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TutorError::ConnectionFailed(
                "loopback connect refused".to_string(),
            ));
        }

        let id = self.open();
        self.inner.status.emit(TransportEvent::Opened {
            connection_id: id,
            reconnected: false,
        });
        Ok(())
    }

    fn send(&self, frame: WireFrame) -> TutorResult<()> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(TutorError::NotConnected);
        }
        self.inner.sent.lock().push(frame);
        Ok(())
    }

    fn on_frame(&self, handler: FrameHandler) -> Subscription {
        let id = self.inner.frames.add(handler);
        Subscription::new(&self.inner.frames, id)
    }

    fn on_status(&self, handler: StatusHandler) -> Subscription {
        let id = self.inner.status.add(handler);
        Subscription::new(&self.inner.status, id)
    }

    fn disconnect(&self) {
        self.inner.disconnects.fetch_add(1, Ordering::SeqCst);
        self.inner.connected.store(false, Ordering::SeqCst);
        let had_connection = match self.inner.info.lock().as_mut() {
            Some(info) => {
                info.state = ConnectionState::Closed;
                true
            }
            None => false,
        };
        if had_connection {
            self.inner.status.emit(TransportEvent::Closed);
        }
        self.inner.frames.clear();
        self.inner.status.clear();
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    fn connection(&self) -> Option<ConnectionInfo> {
        self.inner.info.lock().clone()
    }
}
