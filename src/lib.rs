pub mod config;
pub mod core;
pub mod errors;
pub mod session;

// Re-export commonly used items for convenience
pub use config::TutorConfig;
pub use core::*;
pub use errors::{TutorError, TutorResult};
pub use session::{HandshakeBuilder, SessionSettings, SessionState, TutorSession};
