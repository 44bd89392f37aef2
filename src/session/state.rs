//! Observable session state.
//!
//! [`SessionState`] is the one record the UI reads. It is owned by the
//! session's event loop, mutated only there, and published as a snapshot after
//! every event that changes it.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::calls::{BadgeAward, MasteryRecord, ProfileDelta, SessionSummary, StruggleRecord};
use crate::core::audio::ClipId;
use crate::core::transport::Speaker;

/// Coarse phase reported to the UI. Overlays win: a paused session reports
/// `Paused` whatever it was doing underneath.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PhaseKind {
    /// No connection
    #[default]
    Disconnected,
    /// Opening or re-opening the connection
    Connecting,
    /// Connected, nobody talking
    ConnectedIdle,
    /// Microphone streaming
    Listening,
    /// Tutor audio playing
    AiSpeaking,
    /// Microphone muted
    Muted,
    /// Session timer paused
    Paused,
    /// Terminal
    Ended,
}

impl fmt::Display for PhaseKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PhaseKind::Disconnected => "disconnected",
            PhaseKind::Connecting => "connecting",
            PhaseKind::ConnectedIdle => "connected-idle",
            PhaseKind::Listening => "listening",
            PhaseKind::AiSpeaking => "ai-speaking",
            PhaseKind::Muted => "muted",
            PhaseKind::Paused => "paused",
            PhaseKind::Ended => "ended",
        };
        f.write_str(name)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// The learner closed the session
    UserEnded,
    /// The tutor delivered its summary
    SummaryReceived,
    /// No summary arrived within the grace window
    TimedOut,
    /// The session was torn down
    Disposed,
}

impl fmt::Display for EndReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EndReason::UserEnded => "user_ended",
            EndReason::SummaryReceived => "summary_received",
            EndReason::TimedOut => "timed_out",
            EndReason::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// One displayed utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// Monotonic id, starting at 1
    pub id: u64,
    /// Message text
    pub text: String,
    /// Who said it
    pub speaker: Speaker,
    /// Native-language aside
    pub is_whisper: bool,
    /// Translation attached after the fact
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub translation: Option<String>,
    /// Recorded audio of the turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_ref: Option<ClipId>,
}

/// A lesson objective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionTask {
    /// Task id as given to the tutor
    pub id: String,
    /// Objective text
    pub text: String,
    /// Achieved
    #[serde(default)]
    pub completed: bool,
}

impl SessionTask {
    /// Open task.
    pub fn new(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            text: text.into(),
            completed: false,
        }
    }

    /// Whether `requested` names this task.
    ///
    /// The tutor drifts between id spellings, so `"task-1"`, `"task_1"` and
    /// `"1"` all name the task `"task-1"`. An exact match always wins.
    pub fn matches(&self, requested: &str) -> bool {
        let requested = requested.trim();
        if self.id == requested {
            return true;
        }
        let ours = normalize_task_id(&self.id);
        let theirs = normalize_task_id(requested);
        if ours.is_empty() || theirs.is_empty() {
            return false;
        }
        match (ours.parse::<u64>(), theirs.parse::<u64>()) {
            (Ok(a), Ok(b)) => a == b,
            _ => ours.eq_ignore_ascii_case(theirs),
        }
    }
}

fn normalize_task_id(id: &str) -> &str {
    let id = id.trim();
    let lower = id.to_ascii_lowercase();
    for prefix in ["task-", "task_", "task"] {
        if lower.starts_with(prefix) {
            return id[prefix.len()..].trim();
        }
    }
    id
}

/// Snapshot of a session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Reported phase
    pub phase: PhaseKind,
    /// Microphone muted
    pub muted: bool,
    /// Session timer paused
    pub paused: bool,
    /// Whisper mode active
    pub whisper: bool,
    /// Microphone chunks are being sent
    pub listening: bool,
    /// Tutor audio is playing
    pub speaking: bool,
    /// Wrap-up requested, waiting for the summary
    pub awaiting_summary: bool,
    /// Id of the current connection
    pub connection_id: Option<u64>,
    /// Last connection error, cleared on the next open
    pub connection_error: Option<String>,
    /// Whether a manual reconnect is possible
    pub can_reconnect: bool,
    /// Retry in progress, if any
    pub reconnect_attempt: Option<u32>,
    /// Displayed conversation
    pub messages: Vec<ConversationMessage>,
    /// Logged errors
    pub struggles: Vec<StruggleRecord>,
    /// Profile updates
    pub profile_updates: Vec<ProfileDelta>,
    /// Lesson objectives
    pub tasks: Vec<SessionTask>,
    /// Ids of completed tasks, in completion order
    pub completed_tasks: Vec<String>,
    /// Badges not yet shown
    pub badges: Vec<BadgeAward>,
    /// Review items mastered
    pub mastered_items: Vec<MasteryRecord>,
    /// Terminal summary
    pub summary: Option<SessionSummary>,
    /// Set once the session ends
    pub end_reason: Option<EndReason>,
    /// Notes for whoever debugs the session
    pub diagnostics: Vec<String>,
    /// Active practice time in whole seconds
    pub practice_seconds: u64,
    #[serde(skip)]
    next_message_id: u64,
}

impl SessionState {
    /// Initial state for a lesson with `tasks`.
    pub fn with_tasks(tasks: Vec<SessionTask>) -> Self {
        Self {
            tasks,
            ..Default::default()
        }
    }

    /// Whether the session reached its terminal state.
    pub fn is_ended(&self) -> bool {
        self.phase == PhaseKind::Ended
    }

    /// Append a message, returning its id.
    pub fn push_message(
        &mut self,
        text: impl Into<String>,
        speaker: Speaker,
        is_whisper: bool,
        audio_ref: Option<ClipId>,
    ) -> u64 {
        self.next_message_id += 1;
        let id = self.next_message_id;
        self.messages.push(ConversationMessage {
            id,
            text: text.into(),
            speaker,
            is_whisper,
            translation: None,
            audio_ref,
        });
        id
    }

    fn message_mut(&mut self, id: u64) -> Option<&mut ConversationMessage> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    /// Attach a late translation. Returns false for an unknown id.
    pub fn attach_translation(&mut self, id: u64, translation: impl Into<String>) -> bool {
        match self.message_mut(id) {
            Some(message) => {
                message.translation = Some(translation.into());
                true
            }
            None => false,
        }
    }

    /// Drop every message and restart ids at 1.
    pub fn clear_conversation(&mut self) {
        self.messages.clear();
        self.next_message_id = 0;
    }

    /// Mark the task named by `requested` complete.
    ///
    /// Returns the canonical id, or `None` when no task matches. Completing a
    /// task twice is harmless.
    pub fn complete_task(&mut self, requested: &str) -> Option<String> {
        let requested = requested.trim();
        let index = self
            .tasks
            .iter()
            .position(|task| task.id == requested)
            .or_else(|| self.tasks.iter().position(|task| task.matches(requested)))?;
        let task = &mut self.tasks[index];
        task.completed = true;
        let id = task.id.clone();
        if !self.completed_tasks.contains(&id) {
            self.completed_tasks.push(id.clone());
        }
        Some(id)
    }

    /// Take the pending badges.
    pub fn take_badges(&mut self) -> Vec<BadgeAward> {
        std::mem::take(&mut self.badges)
    }

    /// Record a diagnostic note.
    pub fn note(&mut self, message: impl Into<String>) {
        self.diagnostics.push(message.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tasks() -> Vec<SessionTask> {
        vec![
            SessionTask::new("task-1", "Greet the waiter"),
            SessionTask::new("task-2", "Order a drink"),
            SessionTask::new("3", "Ask for the bill"),
        ]
    }

    #[test]
    fn test_task_id_spellings() {
        let task = SessionTask::new("task-1", "Greet");
        assert!(task.matches("task-1"));
        assert!(task.matches("1"));
        assert!(task.matches("task_1"));
        assert!(task.matches("Task-01"));
        assert!(!task.matches("task-11"));
        assert!(!task.matches(""));

        let bare = SessionTask::new("3", "Bill");
        assert!(bare.matches("task-3"));
    }

    #[test]
    fn test_complete_task_marks_only_the_match() {
        let mut state = SessionState::with_tasks(tasks());
        assert_eq!(state.complete_task("1"), Some("task-1".to_string()));

        let completed: Vec<bool> = state.tasks.iter().map(|t| t.completed).collect();
        assert_eq!(completed, vec![true, false, false]);
        assert_eq!(state.completed_tasks, vec!["task-1"]);

        // Twice is a no-op
        state.complete_task("task-1");
        assert_eq!(state.completed_tasks.len(), 1);
    }

    #[test]
    fn test_complete_unknown_task() {
        let mut state = SessionState::with_tasks(tasks());
        let before = state.clone();
        assert_eq!(state.complete_task("task-9"), None);
        assert_eq!(state, before);
    }

    #[test]
    fn test_message_ids_are_monotonic_until_cleared() {
        let mut state = SessionState::default();
        let a = state.push_message("Hola", Speaker::Tutor, false, None);
        let b = state.push_message("Hi", Speaker::User, true, None);
        assert_eq!((a, b), (1, 2));

        assert!(state.attach_translation(a, "Hello"));
        assert!(!state.attach_translation(42, "nothing"));
        assert_eq!(state.messages[0].translation.as_deref(), Some("Hello"));

        state.clear_conversation();
        assert!(state.messages.is_empty());
        assert_eq!(state.push_message("again", Speaker::Tutor, false, None), 1);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(PhaseKind::AiSpeaking.to_string(), "ai-speaking");
        assert_eq!(PhaseKind::ConnectedIdle.to_string(), "connected-idle");
        assert_eq!(EndReason::TimedOut.to_string(), "timed_out");
    }
}
