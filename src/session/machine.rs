//! Turn-taking and connection-lifecycle state machine.
//!
//! The machine is pure: [`SessionMachine::step`] takes one [`SessionEvent`],
//! moves to the next [`SessionPhase`] and returns the [`Effect`]s the caller
//! must carry out. It never touches a socket, a device or a clock, so every
//! transition is testable in isolation.
//!
//! # Phases
//!
//! ```text
//! Disconnected -> Connecting -> ConnectedIdle <-> Listening
//!                                     ^   \          |
//!                                     |    v         v
//!                                     +-- AiSpeaking <
//! ```
//!
//! `Muted` and `Paused` are overlays: they wrap the phase they interrupted and
//! restore it when lifted, while the wrapped phase can still change beneath
//! them (a playback that finishes while muted leaves `Muted(ConnectedIdle)`).
//! `Ended` is terminal.

use std::fmt;

use super::state::{EndReason, PhaseKind};
use crate::core::transport::ControlCommand;

/// Current phase, with overlays kept as wrappers around the phase beneath.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionPhase {
    /// No connection
    #[default]
    Disconnected,
    /// Waiting for the transport to open
    Connecting,
    /// Connected, nobody talking
    ConnectedIdle,
    /// Microphone streaming
    Listening,
    /// Tutor audio playing
    AiSpeaking,
    /// Microphone muted over `prior`
    Muted {
        /// Phase beneath the overlay
        prior: Box<SessionPhase>,
    },
    /// Session timer paused over `prior`
    Paused {
        /// Phase beneath the overlay
        prior: Box<SessionPhase>,
    },
    /// Terminal
    Ended {
        /// Why
        reason: EndReason,
    },
}

impl SessionPhase {
    /// Phase beneath every overlay.
    pub fn base(&self) -> &SessionPhase {
        match self {
            SessionPhase::Muted { prior } | SessionPhase::Paused { prior } => prior.base(),
            other => other,
        }
    }

    /// Replace the phase beneath every overlay, keeping the overlays.
    fn with_base(self, base: SessionPhase) -> SessionPhase {
        match self {
            SessionPhase::Muted { prior } => SessionPhase::Muted {
                prior: Box::new(prior.with_base(base)),
            },
            SessionPhase::Paused { prior } => SessionPhase::Paused {
                prior: Box::new(prior.with_base(base)),
            },
            _ => base,
        }
    }

    /// Whether a mute overlay is present at any depth.
    pub fn is_muted(&self) -> bool {
        match self {
            SessionPhase::Muted { .. } => true,
            SessionPhase::Paused { prior } => prior.is_muted(),
            _ => false,
        }
    }

    /// Whether a pause overlay is present at any depth.
    pub fn is_paused(&self) -> bool {
        match self {
            SessionPhase::Paused { .. } => true,
            SessionPhase::Muted { prior } => prior.is_paused(),
            _ => false,
        }
    }

    /// Outermost phase, as reported to the UI.
    pub fn kind(&self) -> PhaseKind {
        match self {
            SessionPhase::Disconnected => PhaseKind::Disconnected,
            SessionPhase::Connecting => PhaseKind::Connecting,
            SessionPhase::ConnectedIdle => PhaseKind::ConnectedIdle,
            SessionPhase::Listening => PhaseKind::Listening,
            SessionPhase::AiSpeaking => PhaseKind::AiSpeaking,
            SessionPhase::Muted { .. } => PhaseKind::Muted,
            SessionPhase::Paused { .. } => PhaseKind::Paused,
            SessionPhase::Ended { .. } => PhaseKind::Ended,
        }
    }

    /// Whether capture may start from this phase.
    pub fn can_listen(&self) -> bool {
        !self.is_paused()
            && matches!(
                self.base(),
                SessionPhase::ConnectedIdle | SessionPhase::AiSpeaking
            )
    }

    /// Whether the phase beneath the overlays has a live connection.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.base(),
            SessionPhase::ConnectedIdle | SessionPhase::Listening | SessionPhase::AiSpeaking
        )
    }
}

impl fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionPhase::Muted { prior } => write!(f, "muted({prior})"),
            SessionPhase::Paused { prior } => write!(f, "paused({prior})"),
            SessionPhase::Ended { reason } => write!(f, "ended({reason})"),
            other => write!(f, "{}", other.kind()),
        }
    }
}

/// Inputs to the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// The orchestrator is opening the transport
    ConnectRequested,
    /// The transport opened
    TransportOpened,
    /// Opening failed, or retries are exhausted
    ConnectFailed,
    /// The connection dropped and a retry is scheduled
    ConnectionLost,
    /// Capture started
    CaptureStarted,
    /// Capture stopped
    CaptureStopped,
    /// Tutor audio became audible
    PlaybackStarted,
    /// Tutor audio went silent
    PlaybackFinished,
    /// Mute toggled
    MuteToggled,
    /// Session timer paused
    PauseRequested,
    /// Session timer resumed
    ResumeRequested,
    /// Whisper key pressed
    WhisperStarted,
    /// Whisper key released
    WhisperEnded,
    /// The tutor finished its turn
    TurnComplete,
    /// The tutor reports it was cut off
    Interrupted,
    /// The external session timer ran out
    TimerExpired,
    /// The session summary arrived
    SummaryReceived,
    /// The end-of-session grace window elapsed
    GraceElapsed,
    /// The learner closed the session
    EndRequested,
    /// The session is being torn down
    Disposed,
}

/// Work the caller must carry out after a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Stop microphone capture
    StopCapture,
    /// Cut tutor audio
    InterruptPlayback,
    /// Send a control frame
    SendControl(ControlCommand),
    /// Ask the tutor in words to wrap up
    RequestWrapUp,
    /// Start the end-of-session grace timer
    ArmGraceTimer,
    /// Cancel the grace timer
    CancelGraceTimer,
    /// Close the transport without reconnecting
    DisconnectTransport,
    /// Persist the outcome and publish the terminal state
    Finalize(EndReason),
}

/// The session state machine.
#[derive(Debug, Clone, Default)]
pub struct SessionMachine {
    phase: SessionPhase,
    whisper: bool,
    awaiting_summary: bool,
}

impl SessionMachine {
    /// Machine in `Disconnected`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> &SessionPhase {
        &self.phase
    }

    /// Whisper flag.
    pub fn whisper(&self) -> bool {
        self.whisper
    }

    /// Whether a wrap-up was requested and the summary is outstanding.
    pub fn awaiting_summary(&self) -> bool {
        self.awaiting_summary
    }

    /// Whether the machine is terminal.
    pub fn is_ended(&self) -> bool {
        matches!(self.phase, SessionPhase::Ended { .. })
    }

    /// Why the session ended, once it has.
    pub fn end_reason(&self) -> Option<EndReason> {
        match self.phase {
            SessionPhase::Ended { reason } => Some(reason),
            _ => None,
        }
    }

    /// Whether microphone chunks may be sent right now.
    pub fn mic_open(&self) -> bool {
        *self.phase.base() == SessionPhase::Listening
            && !self.phase.is_muted()
            && !self.phase.is_paused()
    }

    /// Whether capture may start.
    pub fn can_listen(&self) -> bool {
        self.phase.can_listen()
    }

    /// Apply one event.
    ///
    /// `self.phase` is left at its default while `transition` runs, so
    /// phase checks there must read the `phase` argument.
    pub fn step(&mut self, event: SessionEvent) -> Vec<Effect> {
        if self.is_ended() {
            return Vec::new();
        }
        let phase = std::mem::take(&mut self.phase);
        let (next, effects) = self.transition(phase, event);
        self.phase = next;
        effects
    }

    fn transition(
        &mut self,
        phase: SessionPhase,
        event: SessionEvent,
    ) -> (SessionPhase, Vec<Effect>) {
        let base = phase.base().clone();
        match event {
            SessionEvent::ConnectRequested => match base {
                SessionPhase::Disconnected => (phase.with_base(SessionPhase::Connecting), vec![]),
                _ => (phase, vec![]),
            },

            SessionEvent::TransportOpened => match base {
                SessionPhase::Disconnected | SessionPhase::Connecting => {
                    (phase.with_base(SessionPhase::ConnectedIdle), vec![])
                }
                _ => (phase, vec![]),
            },

            // Overlays belong to a live conversation; a dead one starts clean
            SessionEvent::ConnectFailed => {
                let effects = self.silence(&base);
                if self.awaiting_summary {
                    return self.end_with_teardown(EndReason::TimedOut, effects);
                }
                (SessionPhase::Disconnected, effects)
            }

            SessionEvent::ConnectionLost => {
                let effects = self.silence(&base);
                (phase.with_base(SessionPhase::Connecting), effects)
            }

            SessionEvent::CaptureStarted => {
                if !phase.can_listen() {
                    return (phase, vec![]);
                }
                let effects = match base {
                    SessionPhase::AiSpeaking => vec![Effect::InterruptPlayback],
                    _ => vec![],
                };
                (phase.with_base(SessionPhase::Listening), effects)
            }

            SessionEvent::CaptureStopped => match base {
                SessionPhase::Listening => (
                    phase.with_base(SessionPhase::ConnectedIdle),
                    vec![Effect::SendControl(ControlCommand::AudioStreamEnd)],
                ),
                _ => (phase, vec![]),
            },

            SessionEvent::PlaybackStarted => match base {
                SessionPhase::ConnectedIdle => (phase.with_base(SessionPhase::AiSpeaking), vec![]),
                SessionPhase::Listening => (
                    phase.with_base(SessionPhase::AiSpeaking),
                    vec![
                        Effect::StopCapture,
                        Effect::SendControl(ControlCommand::AudioStreamEnd),
                    ],
                ),
                _ => (phase, vec![]),
            },

            SessionEvent::PlaybackFinished => match base {
                SessionPhase::AiSpeaking => (phase.with_base(SessionPhase::ConnectedIdle), vec![]),
                _ => (phase, vec![]),
            },

            SessionEvent::MuteToggled => (toggle_mute(phase), vec![]),

            SessionEvent::PauseRequested => match phase {
                SessionPhase::Paused { .. } => (phase, vec![]),
                other => (
                    SessionPhase::Paused {
                        prior: Box::new(other),
                    },
                    vec![],
                ),
            },

            SessionEvent::ResumeRequested => match phase {
                SessionPhase::Paused { prior } => (*prior, vec![]),
                other => (other, vec![]),
            },

            SessionEvent::WhisperStarted => {
                if phase.is_connected() {
                    self.whisper = true;
                }
                (phase, vec![])
            }

            // The flag outlives the key press until the tutor answers
            SessionEvent::WhisperEnded => (phase, vec![]),

            SessionEvent::TurnComplete => {
                self.whisper = false;
                (phase, vec![])
            }

            SessionEvent::Interrupted => match base {
                SessionPhase::AiSpeaking => (phase, vec![Effect::InterruptPlayback]),
                _ => (phase, vec![]),
            },

            SessionEvent::TimerExpired => {
                if self.awaiting_summary {
                    return (phase, vec![]);
                }
                if !phase.is_connected() {
                    let effects = self.silence(&base);
                    return self.end(EndReason::TimedOut, effects);
                }
                self.awaiting_summary = true;
                (
                    phase,
                    vec![
                        Effect::SendControl(ControlCommand::ConcludeSession),
                        Effect::RequestWrapUp,
                        Effect::ArmGraceTimer,
                    ],
                )
            }

            // Let the tutor finish its goodbye
            SessionEvent::SummaryReceived => {
                let effects = match base {
                    SessionPhase::Listening => vec![Effect::StopCapture],
                    _ => vec![],
                };
                self.end_with_teardown(EndReason::SummaryReceived, effects)
            }

            SessionEvent::GraceElapsed => {
                if !self.awaiting_summary {
                    return (phase, vec![]);
                }
                let effects = self.silence(&base);
                self.end_with_teardown(EndReason::TimedOut, effects)
            }

            SessionEvent::EndRequested => {
                let effects = self.silence(&base);
                self.end_with_teardown(EndReason::UserEnded, effects)
            }

            SessionEvent::Disposed => {
                let effects = self.silence(&base);
                self.end_with_teardown(EndReason::Disposed, effects)
            }
        }
    }

    /// Effects that stop whatever audio the base phase has running.
    fn silence(&self, base: &SessionPhase) -> Vec<Effect> {
        match base {
            SessionPhase::Listening => vec![Effect::StopCapture],
            SessionPhase::AiSpeaking => vec![Effect::InterruptPlayback],
            _ => vec![],
        }
    }

    fn end_with_teardown(
        &mut self,
        reason: EndReason,
        mut effects: Vec<Effect>,
    ) -> (SessionPhase, Vec<Effect>) {
        effects.insert(0, Effect::CancelGraceTimer);
        effects.push(Effect::DisconnectTransport);
        self.end(reason, effects)
    }

    fn end(&mut self, reason: EndReason, mut effects: Vec<Effect>) -> (SessionPhase, Vec<Effect>) {
        self.whisper = false;
        self.awaiting_summary = false;
        effects.push(Effect::Finalize(reason));
        (SessionPhase::Ended { reason }, effects)
    }
}

/// Mute toggles the innermost mute state, beneath a pause if there is one.
fn toggle_mute(phase: SessionPhase) -> SessionPhase {
    match phase {
        SessionPhase::Muted { prior } => *prior,
        SessionPhase::Paused { prior } => SessionPhase::Paused {
            prior: Box::new(toggle_mute(*prior)),
        },
        other => SessionPhase::Muted {
            prior: Box::new(other),
        },
    }
}
