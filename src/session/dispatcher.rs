//! Function-call dispatcher.
//!
//! [`Dispatcher::dispatch`] finds the handler registered for a call's name,
//! validates the raw call into a [`FunctionCall`], runs the handler against the
//! session state and answers with a result frame. Every call gets an answer, so the tutor's turn is never
//! left waiting: unknown names and bad arguments produce an error result, and
//! the state is left as it was.
//!
//! Handlers mutate state synchronously. Writes to the external store are
//! returned as [`DispatchEffect::Persist`] for the caller to spawn.

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::{debug, warn};

use super::calls::{self, FunctionCall};
use super::persistence::PersistRequest;
use super::state::SessionState;
use crate::core::audio::{ClipId, ClipStore};
use crate::core::transport::{FunctionCallFrame, FunctionResultFrame};
use crate::errors::{TutorError, TutorResult};

/// Response text sent once a requested replay has finished.
pub const REPLAY_DONE_MESSAGE: &str = "Audio played successfully";

/// Follow-up work for the caller.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchEffect {
    /// Write to the external store, best effort
    Persist(PersistRequest),
    /// The summary arrived; end the session
    EndSession,
}

/// What a handler answers.
#[derive(Debug, Clone, PartialEq)]
pub enum HandlerReply {
    /// Answer now, with an optional response body
    Respond(Option<Value>),
    /// Answer after `clip` has been replayed
    AfterReplay(ClipId),
}

/// How the caller must answer the call.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    /// Send this result now
    Ready(FunctionResultFrame),
    /// Replay `clip`, then answer `call`
    AfterReplay {
        /// Clip to replay
        clip: ClipId,
        /// Call to answer afterwards
        call: FunctionCallFrame,
    },
}

/// Result of one dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchOutcome {
    /// How to answer
    pub reply: Reply,
    /// Follow-up work, empty when the call was rejected
    pub effects: Vec<DispatchEffect>,
}

impl DispatchOutcome {
    fn rejected(frame: &FunctionCallFrame, reason: String) -> Self {
        Self {
            reply: Reply::Ready(FunctionResultFrame::error(frame, reason)),
            effects: Vec::new(),
        }
    }

    /// The immediate result, if there is one.
    pub fn result(&self) -> Option<&FunctionResultFrame> {
        match &self.reply {
            Reply::Ready(result) => Some(result),
            Reply::AfterReplay { .. } => None,
        }
    }

    /// Whether the call was accepted.
    pub fn is_accepted(&self) -> bool {
        self.result().is_none_or(FunctionResultFrame::is_ok)
    }
}

/// What a handler may touch.
pub struct DispatchContext<'a> {
    /// Session state
    pub state: &'a mut SessionState,
    /// Stored clips
    pub clips: &'a ClipStore,
    /// Clip of the learner's most recent spoken turn
    pub last_user_clip: Option<&'a ClipId>,
    effects: Vec<DispatchEffect>,
}

impl<'a> DispatchContext<'a> {
    /// Context over `state`.
    pub fn new(
        state: &'a mut SessionState,
        clips: &'a ClipStore,
        last_user_clip: Option<&'a ClipId>,
    ) -> Self {
        Self {
            state,
            clips,
            last_user_clip,
            effects: Vec::new(),
        }
    }

    /// Queue a best-effort write.
    pub fn persist(&mut self, request: PersistRequest) {
        self.effects.push(DispatchEffect::Persist(request));
    }

    /// Ask for the session to end.
    pub fn end_session(&mut self) {
        self.effects.push(DispatchEffect::EndSession);
    }
}

/// Handler for one call name. It must validate before mutating: an `Err`
/// means the state was not touched.
pub type CallHandler =
    Box<dyn Fn(&FunctionCall, &mut DispatchContext<'_>) -> TutorResult<HandlerReply> + Send + Sync>;

/// Registry of call handlers.
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<String, CallHandler>,
}

impl Dispatcher {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with a handler for every built-in call.
    pub fn with_builtin_handlers() -> Self {
        let mut dispatcher = Self::new();
        dispatcher.register(calls::MARK_FOR_REVIEW, handle_mark_for_review);
        dispatcher.register(calls::UPDATE_USER_PROFILE, handle_update_user_profile);
        dispatcher.register(calls::MARK_TASK_COMPLETE, handle_mark_task_complete);
        dispatcher.register(calls::SHOW_SESSION_SUMMARY, handle_show_session_summary);
        dispatcher.register(calls::AWARD_BADGE, handle_award_badge);
        dispatcher.register(calls::PLAY_STUDENT_AUDIO, handle_play_student_audio);
        dispatcher.register(calls::MARK_ITEM_MASTERED, handle_mark_item_mastered);
        dispatcher
    }

    /// Register `handler` for `name`, replacing any previous one.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&FunctionCall, &mut DispatchContext<'_>) -> TutorResult<HandlerReply>
            + Send
            + Sync
            + 'static,
    {
        self.handlers.insert(name.into(), Box::new(handler));
    }

    /// Whether a handler exists for `name`.
    pub fn is_registered(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    /// Validate and run one call.
    pub fn dispatch(
        &self,
        frame: &FunctionCallFrame,
        mut ctx: DispatchContext<'_>,
    ) -> DispatchOutcome {
        if let Some(reason) = &frame.args_error {
            return reject(frame, TutorError::validation(&frame.name, reason.clone()));
        }

        let name = frame.name.as_str();
        let Some(handler) = self.handlers.get(name) else {
            let reason = if calls::schema_for(name).is_some() {
                "no handler registered".to_string()
            } else {
                format!("unknown function '{name}'")
            };
            return reject(frame, TutorError::validation(name, reason));
        };

        let call = match FunctionCall::from_frame(frame) {
            Ok(call) => call,
            Err(e) => return reject(frame, e),
        };

        match handler(&call, &mut ctx) {
            Ok(HandlerReply::Respond(response)) => {
                debug!(call = call.name(), "Function call handled");
                DispatchOutcome {
                    reply: Reply::Ready(FunctionResultFrame::ok(frame, response)),
                    effects: ctx.effects,
                }
            }
            Ok(HandlerReply::AfterReplay(clip)) => {
                debug!(call = call.name(), clip = %clip, "Function call deferred until replay ends");
                DispatchOutcome {
                    reply: Reply::AfterReplay {
                        clip,
                        call: frame.clone(),
                    },
                    effects: ctx.effects,
                }
            }
            Err(e) => reject(frame, e),
        }
    }
}

fn reject(frame: &FunctionCallFrame, error: TutorError) -> DispatchOutcome {
    let reason = match &error {
        TutorError::FunctionCallValidation { reason, .. } => reason.clone(),
        other => other.to_string(),
    };
    let args = Value::Object(frame.args.clone());
    warn!(
        call = %frame.name,
        args = %args,
        reason = %reason,
        "Rejected function call"
    );
    DispatchOutcome::rejected(frame, reason)
}

// =============================================================================
// Built-in handlers
// =============================================================================

fn handle_mark_for_review(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::MarkForReview(record) = call else {
        return Err(mismatched(call));
    };
    let mut record = record.clone();
    record.audio_ref = ctx.last_user_clip.map(ToString::to_string);
    ctx.state.struggles.push(record.clone());
    ctx.persist(PersistRequest::Struggle(record));
    Ok(HandlerReply::Respond(None))
}

fn handle_update_user_profile(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::UpdateUserProfile(delta) = call else {
        return Err(mismatched(call));
    };
    ctx.state.profile_updates.push(delta.clone());
    ctx.persist(PersistRequest::Profile(delta.clone()));
    Ok(HandlerReply::Respond(None))
}

fn handle_mark_task_complete(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::MarkTaskComplete { task_id } = call else {
        return Err(mismatched(call));
    };
    let Some(id) = ctx.state.complete_task(task_id) else {
        return Err(TutorError::validation(
            call.name(),
            format!("unknown task id '{task_id}'"),
        ));
    };
    ctx.persist(PersistRequest::TaskComplete {
        task_id: id.clone(),
    });
    Ok(HandlerReply::Respond(Some(json!({ "task_id": id }))))
}

fn handle_show_session_summary(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::ShowSessionSummary(summary) = call else {
        return Err(mismatched(call));
    };
    ctx.state.summary = Some(summary.clone());
    ctx.end_session();
    Ok(HandlerReply::Respond(None))
}

fn handle_award_badge(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::AwardBadge(badge) = call else {
        return Err(mismatched(call));
    };
    ctx.state.badges.push(badge.clone());
    ctx.persist(PersistRequest::Badge(badge.clone()));
    Ok(HandlerReply::Respond(None))
}

fn handle_play_student_audio(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::PlayStudentAudio { review_item_id } = call else {
        return Err(mismatched(call));
    };
    let clip = ClipId::new(review_item_id.as_str());
    if !ctx.clips.contains(&clip) {
        return Err(TutorError::validation(
            call.name(),
            format!("no recorded audio for review item '{review_item_id}'"),
        ));
    }
    Ok(HandlerReply::AfterReplay(clip))
}

fn handle_mark_item_mastered(
    call: &FunctionCall,
    ctx: &mut DispatchContext<'_>,
) -> TutorResult<HandlerReply> {
    let FunctionCall::MarkItemMastered(record) = call else {
        return Err(mismatched(call));
    };
    ctx.state.mastered_items.push(record.clone());
    ctx.persist(PersistRequest::Mastery(record.clone()));
    Ok(HandlerReply::Respond(None))
}

fn mismatched(call: &FunctionCall) -> TutorError {
    TutorError::Internal(format!("handler received mismatched call '{}'", call.name()))
}
