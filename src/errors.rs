//! Error taxonomy for the tutoring session core.
//!
//! Transport errors are recovered locally up to the reconnection cap and then
//! surfaced through [`SessionState`](crate::session::SessionState). Frame-parsing
//! and function-call errors never terminate the connection. Device errors are
//! returned synchronously to whoever asked for capture to start.

use thiserror::Error;

/// Errors that can occur while running a tutoring session.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TutorError {
    /// The socket failed to open, or dropped and could not be re-established
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A send was attempted while the transport was offline
    #[error("Not connected")]
    NotConnected,

    /// An inbound payload could not be parsed into a frame
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// A function call was unknown or its arguments failed validation
    #[error("Function call '{name}' rejected: {reason}")]
    FunctionCallValidation {
        /// Call name as received
        name: String,
        /// Human readable rejection reason, echoed back to the tutor
        reason: String,
    },

    /// The microphone or speaker could not be acquired or failed mid-stream
    #[error("Audio device error: {0}")]
    AudioDevice(String),

    /// No session summary arrived within the end-of-session grace window
    #[error("Session timed out after {0} seconds without a summary")]
    SessionTimeout(u64),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// WebSocket error
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// The persistence service rejected or failed a write
    #[error("Persistence error: {0}")]
    Persistence(String),

    /// The session already reached its terminal state
    #[error("Session has ended")]
    SessionEnded,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TutorError {
    /// Build a validation error for a named call.
    pub fn validation(name: impl Into<String>, reason: impl Into<String>) -> Self {
        TutorError::FunctionCallValidation {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether this error is handled entirely inside the session core.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            TutorError::MalformedFrame(_) | TutorError::FunctionCallValidation { .. }
        )
    }
}

impl From<serde_json::Error> for TutorError {
    fn from(err: serde_json::Error) -> Self {
        TutorError::SerializationError(err.to_string())
    }
}

/// Result type for session operations.
pub type TutorResult<T> = Result<T, TutorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TutorError::ConnectionFailed("refused".to_string());
        assert!(err.to_string().contains("Connection failed"));

        assert_eq!(TutorError::NotConnected.to_string(), "Not connected");

        let err = TutorError::validation("mark_task_complete", "missing field 'task_id'");
        assert_eq!(
            err.to_string(),
            "Function call 'mark_task_complete' rejected: missing field 'task_id'"
        );
    }

    #[test]
    fn test_recoverable_errors() {
        assert!(TutorError::MalformedFrame("x".into()).is_recoverable());
        assert!(TutorError::validation("a", "b").is_recoverable());
        assert!(!TutorError::NotConnected.is_recoverable());
        assert!(!TutorError::AudioDevice("busy".into()).is_recoverable());
    }
}
