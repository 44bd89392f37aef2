pub mod audio;
pub mod transport;

// Re-export commonly used types for convenience
pub use audio::{
    AudioCapture, AudioClip, AudioConfig, AudioPlayback, ClipId, ClipStore, InputDevice,
    OutputDevice, PcmFormat, PlaybackEvent, PlaybackOutcome,
};

pub use transport::{
    ControlCommand, FunctionCallFrame, FunctionResultFrame, Handshake, HandshakeMode,
    LoopbackTransport, ReconnectionConfig, Speaker, Transport, TransportConfig, TransportEvent,
    WebSocketTransport, WireFrame,
};
