//! Tutoring session layer.
//!
//! [`TutorSession`] is the entry point. The pieces it is built from are public
//! so hosts can register extra call handlers, swap the persistence backend or
//! drive the [`SessionMachine`] directly in tests.

pub mod calls;
pub mod dispatcher;
pub mod handshake;
pub mod machine;
pub mod orchestrator;
pub mod persistence;
pub mod state;

pub use calls::{
    BadgeAward, Confidence, FunctionCall, MasteryRecord, ProfileDelta, SessionSummary,
    StruggleRecord,
};
pub use dispatcher::{
    DispatchContext, DispatchEffect, DispatchOutcome, Dispatcher, HandlerReply,
    REPLAY_DONE_MESSAGE, Reply,
};
pub use handshake::{HandshakeBuilder, ReviewItem};
pub use machine::{Effect, SessionEvent, SessionMachine, SessionPhase};
pub use orchestrator::{
    DEFAULT_OPENING_TURN, DEFAULT_SUMMARY_GRACE, DEFAULT_WRAP_UP_PROMPT, SessionSettings,
    TutorSession, TutorSessionBuilder,
};
pub use persistence::{
    DEFAULT_PERSISTENCE_TIMEOUT, HttpPersistence, MemoryPersistence, NoopPersistence,
    PersistRequest, Persistence, fire_and_forget,
};
pub use state::{ConversationMessage, EndReason, PhaseKind, SessionState, SessionTask};
