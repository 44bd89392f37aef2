//! Session orchestrator.
//!
//! [`TutorSession`] composes the transport, both audio pipelines, the state
//! machine and the dispatcher behind one handle. Every input (commands, inbound
//! frames, transport and playback notifications, timers) is funnelled into a
//! single queue and handled one at a time by the session task, which is the
//! only code that mutates [`SessionState`]. A snapshot is published on a
//! `watch` channel after each input.
//!
//! Microphone chunks are the exception: they go straight from the capture
//! callback to the transport, behind an atomic gate that mirrors
//! [`SessionMachine::mic_open`]. Chunks that arrive while the gate is closed
//! or the transport is offline are dropped.
//!
//! # Teardown
//!
//! [`TutorSession::dispose`] is synchronous and idempotent: it cancels every
//! timer, aborts capture, shuts playback down and disconnects the transport
//! before returning. Dropping the handle disposes it.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::calls::BadgeAward;
use super::dispatcher::{DispatchContext, DispatchEffect, Dispatcher, REPLAY_DONE_MESSAGE, Reply};
use super::machine::{Effect, SessionEvent, SessionMachine, SessionPhase};
use super::persistence::{NoopPersistence, PersistRequest, Persistence, fire_and_forget};
use super::state::{EndReason, SessionState, SessionTask};
use crate::core::audio::{
    AudioCapture, AudioClip, AudioConfig, AudioPlayback, ChunkHandler, ClipId, ClipStore,
    InputDevice, NullInput, NullOutput, OutputDevice, PlaybackEvent, PlaybackOutcome,
    TurnRecorder,
};
use crate::core::transport::{
    AudioFrame, ControlCommand, FunctionCallFrame, FunctionResultFrame, Handshake, Speaker, Subscription,
    TextFrame, Transport, TransportEvent, WireFrame,
};
use crate::errors::{TutorError, TutorResult};

/// How long to wait for the summary after asking the tutor to wrap up.
pub const DEFAULT_SUMMARY_GRACE: Duration = Duration::from_secs(30);

/// Turn sent on connect so the tutor starts talking first.
pub const DEFAULT_OPENING_TURN: &str = "Hello";

/// Text sent alongside `conclude_session` when the session timer runs out.
pub const DEFAULT_WRAP_UP_PROMPT: &str =
    "Our time is up. Please say goodbye and call show_session_summary now.";

/// Session behaviour knobs.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Capture and playback formats
    pub audio: AudioConfig,
    /// Grace window for the summary after the timer expires
    pub summary_grace: Duration,
    /// Hidden opening turn
    pub opening_turn: String,
    /// Hidden wrap-up request
    pub wrap_up_prompt: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            audio: AudioConfig::default(),
            summary_grace: DEFAULT_SUMMARY_GRACE,
            opening_turn: DEFAULT_OPENING_TURN.to_string(),
            wrap_up_prompt: DEFAULT_WRAP_UP_PROMPT.to_string(),
        }
    }
}

enum Command {
    SendText {
        text: String,
        whisper: bool,
        reply: oneshot::Sender<TutorResult<()>>,
    },
    StartListening {
        whisper: bool,
        reply: oneshot::Sender<TutorResult<()>>,
    },
    StopListening {
        whisper_ended: bool,
        reply: oneshot::Sender<()>,
    },
    ToggleMute,
    Pause,
    Resume,
    Interrupt,
    Replay {
        clip: ClipId,
        reply: oneshot::Sender<TutorResult<()>>,
    },
    TimerExpired,
    End,
    AttachTranslation {
        id: u64,
        text: String,
        reply: oneshot::Sender<bool>,
    },
    ClearConversation,
    TakeBadges {
        reply: oneshot::Sender<Vec<BadgeAward>>,
    },
}

enum Input {
    Command(Command),
    ConnectRequested,
    ConnectFailed(TutorError),
    Frame(WireFrame),
    Transport(TransportEvent),
    Playback(PlaybackEvent),
    ReplayFinished {
        call: FunctionCallFrame,
        outcome: PlaybackOutcome,
    },
    GraceElapsed,
    Disposed,
}

// =============================================================================
// Builder
// =============================================================================

/// Assembles a [`TutorSession`].
pub struct TutorSessionBuilder {
    transport: Arc<dyn Transport>,
    settings: SessionSettings,
    tasks: Vec<SessionTask>,
    input: Box<dyn InputDevice>,
    output: Arc<dyn OutputDevice>,
    persistence: Arc<dyn Persistence>,
    dispatcher: Dispatcher,
    clips: ClipStore,
}

impl TutorSessionBuilder {
    /// Session settings.
    pub fn settings(mut self, settings: SessionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Lesson objectives.
    pub fn tasks(mut self, tasks: Vec<SessionTask>) -> Self {
        self.tasks = tasks;
        self
    }

    /// Microphone.
    pub fn input(mut self, input: Box<dyn InputDevice>) -> Self {
        self.input = input;
        self
    }

    /// Speaker.
    pub fn output(mut self, output: Arc<dyn OutputDevice>) -> Self {
        self.output = output;
        self
    }

    /// External store.
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = persistence;
        self
    }

    /// Replace the built-in call handlers.
    pub fn dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Share an existing clip store, e.g. one preloaded for a review lesson.
    pub fn clips(mut self, clips: ClipStore) -> Self {
        self.clips = clips;
        self
    }

    /// Spawn the session task. Must be called from within a tokio runtime.
    pub fn build(self) -> TutorSession {
        let (inputs, queue) = mpsc::unbounded_channel();
        let initial = SessionState::with_tasks(self.tasks);
        let (publisher, state) = watch::channel(initial.clone());

        let audio = self.settings.audio;
        let capture = Arc::new(AudioCapture::new(audio, self.input));
        let playback = Arc::new(AudioPlayback::new(
            self.output,
            audio.output_format(),
            self.clips.clone(),
        ));

        let playback_events = {
            let inputs = inputs.clone();
            playback.on_event(Arc::new(move |event: PlaybackEvent| {
                let _ = inputs.send(Input::Playback(event));
            }))
        };

        let mic_gate = Arc::new(AtomicBool::new(false));
        let user_recorder = Arc::new(Mutex::new(TurnRecorder::new(audio.input_format())));
        let on_chunk = mic_chunk_handler(
            mic_gate.clone(),
            self.transport.clone(),
            user_recorder.clone(),
            audio.input_format().mime(),
        );
        let shutdown = CancellationToken::new();

        let core = SessionCore {
            machine: SessionMachine::new(),
            state: initial,
            dispatcher: self.dispatcher,
            tutor_recorder: TurnRecorder::new(audio.output_format()),
            settings: self.settings,
            transport: self.transport.clone(),
            capture: capture.clone(),
            playback: playback.clone(),
            clips: self.clips.clone(),
            persistence: self.persistence,
            inputs: inputs.clone(),
            publisher,
            mic_gate: mic_gate.clone(),
            on_chunk,
            user_recorder,
            tutor_text: String::new(),
            last_user_clip: None,
            grace: None,
            shutdown: shutdown.clone(),
            active_since: None,
            practiced: Duration::ZERO,
        };
        tokio::spawn(core.run(queue));

        TutorSession {
            inputs,
            state,
            transport: self.transport,
            capture,
            playback,
            clips: self.clips,
            mic_gate,
            shutdown,
            disposed: AtomicBool::new(false),
            handshake: Mutex::new(None),
            playback_events: Mutex::new(Some(playback_events)),
            subscriptions: Mutex::new(Vec::new()),
        }
    }
}

fn mic_chunk_handler(
    gate: Arc<AtomicBool>,
    transport: Arc<dyn Transport>,
    recorder: Arc<Mutex<TurnRecorder>>,
    mime: String,
) -> ChunkHandler {
    Arc::new(move |chunk: Bytes| {
        if !gate.load(Ordering::SeqCst) {
            return;
        }
        recorder.lock().push_pcm(&chunk);
        let frame = WireFrame::Audio(AudioFrame {
            payload: chunk,
            mime: mime.clone(),
        });
        match transport.send(frame) {
            Ok(()) => {}
            Err(TutorError::NotConnected) => debug!("Offline; microphone chunk dropped"),
            Err(e) => warn!(error = %e, "Failed to send microphone chunk"),
        }
    })
}

// =============================================================================
// Handle
// =============================================================================

/// A live tutoring session.
pub struct TutorSession {
    inputs: mpsc::UnboundedSender<Input>,
    state: watch::Receiver<SessionState>,
    transport: Arc<dyn Transport>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    clips: ClipStore,
    mic_gate: Arc<AtomicBool>,
    shutdown: CancellationToken,
    disposed: AtomicBool,
    handshake: Mutex<Option<Handshake>>,
    playback_events: Mutex<Option<Subscription>>,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl TutorSession {
    /// Start assembling a session over `transport`.
    pub fn builder(transport: Arc<dyn Transport>) -> TutorSessionBuilder {
        TutorSessionBuilder {
            transport,
            settings: SessionSettings::default(),
            tasks: Vec::new(),
            input: Box::new(NullInput),
            output: Arc::new(NullOutput),
            persistence: Arc::new(NoopPersistence),
            dispatcher: Dispatcher::with_builtin_handlers(),
            clips: ClipStore::new(),
        }
    }

    /// Open the transport with `handshake`.
    ///
    /// Resolves once the socket is open. The hidden opening turn goes out as
    /// soon as the session task sees the connection.
    pub async fn start(&self, handshake: Handshake) -> TutorResult<()> {
        self.ensure_live()?;
        *self.handshake.lock() = Some(handshake.clone());
        self.open(handshake).await
    }

    /// Connect again after a terminal connection error.
    pub async fn reconnect(&self) -> TutorResult<()> {
        self.ensure_live()?;
        if self.transport.is_connected() {
            return Ok(());
        }
        let handshake = self
            .handshake
            .lock()
            .clone()
            .ok_or_else(|| TutorError::Internal("reconnect called before start".to_string()))?;
        info!("Manual reconnect requested");
        self.open(handshake).await
    }

    async fn open(&self, handshake: Handshake) -> TutorResult<()> {
        self.attach_transport();
        self.post(Input::ConnectRequested);
        if let Err(e) = self.transport.connect(handshake).await {
            warn!(error = %e, "Tutor connection failed");
            self.post(Input::ConnectFailed(e.clone()));
            return Err(e);
        }
        Ok(())
    }

    /// Register fresh transport listeners. `disconnect` clears them, so this
    /// runs before every connect.
    fn attach_transport(&self) {
        let mut subscriptions = self.subscriptions.lock();
        let frames = {
            let inputs = self.inputs.clone();
            self.transport.on_frame(Arc::new(move |frame: WireFrame| {
                let _ = inputs.send(Input::Frame(frame));
            }))
        };
        let status = {
            let inputs = self.inputs.clone();
            self.transport.on_status(Arc::new(move |event: TransportEvent| {
                let _ = inputs.send(Input::Transport(event));
            }))
        };
        for subscription in subscriptions.drain(..) {
            subscription.unsubscribe();
        }
        subscriptions.push(frames);
        subscriptions.push(status);
    }

    /// Send a typed message. It is shown in the conversation once sent.
    pub async fn send_text(&self, text: impl Into<String>, whisper: bool) -> TutorResult<()> {
        let text = text.into();
        self.request(|reply| Command::SendText {
            text,
            whisper,
            reply,
        })
        .await
        .unwrap_or(Err(TutorError::SessionEnded))
    }

    /// Open the microphone. Device errors are returned here.
    pub async fn start_listening(&self) -> TutorResult<()> {
        self.request(|reply| Command::StartListening {
            whisper: false,
            reply,
        })
        .await
        .unwrap_or(Err(TutorError::SessionEnded))
    }

    /// Close the microphone, flushing the last chunk.
    pub async fn stop_listening(&self) {
        let _ = self
            .request(|reply| Command::StopListening {
                whisper_ended: false,
                reply,
            })
            .await;
    }

    /// Press the whisper key: open the microphone in whisper mode.
    pub async fn start_whisper(&self) -> TutorResult<()> {
        self.request(|reply| Command::StartListening {
            whisper: true,
            reply,
        })
        .await
        .unwrap_or(Err(TutorError::SessionEnded))
    }

    /// Release the whisper key. Whisper mode lasts until the tutor's turn
    /// completes.
    pub async fn end_whisper(&self) {
        let _ = self
            .request(|reply| Command::StopListening {
                whisper_ended: true,
                reply,
            })
            .await;
    }

    /// Toggle the microphone mute.
    pub fn toggle_mute(&self) {
        self.post(Input::Command(Command::ToggleMute));
    }

    /// The external session timer was paused.
    pub fn pause(&self) {
        self.post(Input::Command(Command::Pause));
    }

    /// The external session timer resumed.
    pub fn resume(&self) {
        self.post(Input::Command(Command::Resume));
    }

    /// Stop tutor audio now.
    pub fn interrupt(&self) {
        self.post(Input::Command(Command::Interrupt));
    }

    /// Replay a stored clip.
    pub async fn replay(&self, clip: &ClipId) -> TutorResult<()> {
        let clip = clip.clone();
        self.request(|reply| Command::Replay { clip, reply })
            .await
            .unwrap_or(Err(TutorError::SessionEnded))
    }

    /// The external session timer ran out: ask the tutor to wrap up.
    pub fn notify_time_expired(&self) {
        self.post(Input::Command(Command::TimerExpired));
    }

    /// End the session now.
    pub fn trigger_end(&self) {
        self.post(Input::Command(Command::End));
    }

    /// Attach a translation to a displayed message.
    pub async fn attach_translation(&self, message_id: u64, text: impl Into<String>) -> bool {
        let text = text.into();
        self.request(|reply| Command::AttachTranslation {
            id: message_id,
            text,
            reply,
        })
        .await
        .unwrap_or(false)
    }

    /// Drop the displayed conversation and restart message ids.
    pub fn clear_conversation(&self) {
        self.post(Input::Command(Command::ClearConversation));
    }

    /// Take the badges awarded since the last call.
    pub async fn take_badges(&self) -> Vec<BadgeAward> {
        self.request(|reply| Command::TakeBadges { reply })
            .await
            .unwrap_or_default()
    }

    /// Store a clip for `play_student_audio`, keyed by its review item id.
    pub fn preload_clip(&self, clip: AudioClip) {
        self.clips.insert(clip);
    }

    /// Stored clips.
    pub fn clips(&self) -> &ClipStore {
        &self.clips
    }

    /// Current state snapshot.
    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    /// Receiver that sees every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until a snapshot satisfies `predicate`.
    pub async fn wait_for(
        &self,
        mut predicate: impl FnMut(&SessionState) -> bool,
    ) -> TutorResult<SessionState> {
        let mut receiver = self.state.clone();
        let state = receiver
            .wait_for(|state| predicate(state))
            .await
            .map_err(|_| TutorError::SessionEnded)?;
        Ok(state.clone())
    }

    /// Whether `dispose` has run.
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Release the microphone, speaker and socket, and cancel every timer.
    /// Safe to call any number of times.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Disposing tutor session");
        self.shutdown.cancel();
        self.mic_gate.store(false, Ordering::SeqCst);
        self.capture.abort();
        self.playback.shutdown();
        self.transport.disconnect();
        for subscription in self.subscriptions.lock().drain(..) {
            subscription.unsubscribe();
        }
        if let Some(subscription) = self.playback_events.lock().take() {
            subscription.unsubscribe();
        }
        // The session task publishes the final state and exits
        self.post(Input::Disposed);
    }

    fn ensure_live(&self) -> TutorResult<()> {
        if self.is_disposed() || self.state.borrow().is_ended() {
            return Err(TutorError::SessionEnded);
        }
        Ok(())
    }

    fn post(&self, input: Input) {
        if self.inputs.send(input).is_err() {
            debug!("Session task has exited; input dropped");
        }
    }

    async fn request<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Option<T> {
        let (reply, response) = oneshot::channel();
        self.inputs.send(Input::Command(command(reply))).ok()?;
        response.await.ok()
    }
}

impl Drop for TutorSession {
    fn drop(&mut self) {
        self.dispose();
    }
}

// =============================================================================
// Session task
// =============================================================================

struct SessionCore {
    machine: SessionMachine,
    state: SessionState,
    dispatcher: Dispatcher,
    settings: SessionSettings,
    transport: Arc<dyn Transport>,
    capture: Arc<AudioCapture>,
    playback: Arc<AudioPlayback>,
    clips: ClipStore,
    persistence: Arc<dyn Persistence>,
    inputs: mpsc::UnboundedSender<Input>,
    publisher: watch::Sender<SessionState>,
    mic_gate: Arc<AtomicBool>,
    on_chunk: ChunkHandler,
    user_recorder: Arc<Mutex<TurnRecorder>>,
    tutor_recorder: TurnRecorder,
    tutor_text: String,
    last_user_clip: Option<ClipId>,
    grace: Option<CancellationToken>,
    shutdown: CancellationToken,
    active_since: Option<Instant>,
    practiced: Duration,
}

impl SessionCore {
    async fn run(mut self, mut queue: mpsc::UnboundedReceiver<Input>) {
        while let Some(input) = queue.recv().await {
            let disposing = matches!(input, Input::Disposed);
            self.handle(input).await;
            self.publish();
            if disposing {
                break;
            }
        }
        debug!("Session task exited");
    }

    async fn handle(&mut self, input: Input) {
        match input {
            Input::Command(command) => self.handle_command(command).await,
            Input::ConnectRequested => self.apply(SessionEvent::ConnectRequested).await,
            Input::ConnectFailed(error) => self.connection_failed(error).await,
            Input::Frame(frame) => self.handle_frame(frame).await,
            Input::Transport(event) => self.handle_transport(event).await,
            Input::Playback(event) => self.handle_playback(event).await,
            Input::ReplayFinished { call, outcome } => self.finish_replay(call, outcome),
            Input::GraceElapsed => self.apply(SessionEvent::GraceElapsed).await,
            Input::Disposed => self.apply(SessionEvent::Disposed).await,
        }
    }

    async fn apply(&mut self, event: SessionEvent) {
        let effects = self.machine.step(event);
        self.sync_gate();
        for effect in effects {
            self.execute(effect).await;
        }
    }

    fn sync_gate(&self) {
        self.mic_gate.store(self.machine.mic_open(), Ordering::SeqCst);
    }

    async fn execute(&mut self, effect: Effect) {
        match effect {
            Effect::StopCapture => {
                self.capture.stop().await;
                self.store_user_turn();
            }
            Effect::InterruptPlayback => self.playback.interrupt(),
            Effect::SendControl(command) => self.send(WireFrame::Control(command)),
            Effect::RequestWrapUp => {
                let prompt = TextFrame::user(self.settings.wrap_up_prompt.clone(), false);
                self.send(WireFrame::Text(prompt));
            }
            Effect::ArmGraceTimer => self.arm_grace_timer(),
            Effect::CancelGraceTimer => {
                if let Some(timer) = self.grace.take() {
                    timer.cancel();
                }
            }
            Effect::DisconnectTransport => {
                // Already done synchronously by dispose
                if !self.shutdown.is_cancelled() {
                    self.transport.disconnect();
                }
            }
            Effect::Finalize(reason) => self.finalize(reason),
        }
    }

    // -------------------------------------------------------------------------
    // Commands
    // -------------------------------------------------------------------------

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::SendText {
                text,
                whisper,
                reply,
            } => {
                let _ = reply.send(self.send_text(text, whisper));
            }
            Command::StartListening { whisper, reply } => {
                let result = self.start_listening(whisper).await;
                let _ = reply.send(result);
            }
            Command::StopListening {
                whisper_ended,
                reply,
            } => {
                self.stop_listening(whisper_ended).await;
                let _ = reply.send(());
            }
            Command::ToggleMute => self.apply(SessionEvent::MuteToggled).await,
            Command::Pause => self.apply(SessionEvent::PauseRequested).await,
            Command::Resume => self.apply(SessionEvent::ResumeRequested).await,
            Command::Interrupt => {
                debug!("Playback interrupted by the learner");
                self.playback.interrupt();
            }
            Command::Replay { clip, reply } => {
                let result = if self.machine.is_ended() {
                    Err(TutorError::SessionEnded)
                } else {
                    self.playback.replay(&clip).map(|_| ())
                };
                let _ = reply.send(result);
            }
            Command::TimerExpired => self.apply(SessionEvent::TimerExpired).await,
            Command::End => self.apply(SessionEvent::EndRequested).await,
            Command::AttachTranslation { id, text, reply } => {
                let _ = reply.send(self.state.attach_translation(id, text));
            }
            Command::ClearConversation => self.state.clear_conversation(),
            Command::TakeBadges { reply } => {
                let _ = reply.send(self.state.take_badges());
            }
        }
    }

    fn send_text(&mut self, text: String, whisper: bool) -> TutorResult<()> {
        if self.machine.is_ended() {
            return Err(TutorError::SessionEnded);
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let whisper = whisper || self.machine.whisper();
        self.transport
            .send(WireFrame::Text(TextFrame::user(text, whisper)))?;
        self.commit_tutor_turn();
        self.state.push_message(text, Speaker::User, whisper, None);
        Ok(())
    }

    async fn start_listening(&mut self, whisper: bool) -> TutorResult<()> {
        if self.machine.is_ended() {
            return Err(TutorError::SessionEnded);
        }
        if !self.machine.phase().is_connected() {
            return Err(TutorError::NotConnected);
        }
        if !self.machine.can_listen() {
            debug!(phase = %self.machine.phase(), "Capture not started");
            return Ok(());
        }
        self.user_recorder.lock().clear();
        self.capture.start(self.on_chunk.clone()).await?;
        if whisper {
            self.apply(SessionEvent::WhisperStarted).await;
        }
        self.apply(SessionEvent::CaptureStarted).await;
        Ok(())
    }

    async fn stop_listening(&mut self, whisper_ended: bool) {
        if *self.machine.phase().base() == SessionPhase::Listening {
            // Flush while the gate is still open
            self.capture.stop().await;
            self.store_user_turn();
        }
        self.apply(SessionEvent::CaptureStopped).await;
        if whisper_ended {
            self.apply(SessionEvent::WhisperEnded).await;
        }
    }

    // -------------------------------------------------------------------------
    // Inbound frames
    // -------------------------------------------------------------------------

    async fn handle_frame(&mut self, frame: WireFrame) {
        if self.machine.is_ended() {
            debug!(kind = frame.kind(), "Frame arrived after session end");
            self.state.note(format!(
                "Ignored {} frame received after the session ended",
                frame.kind()
            ));
            return;
        }
        match frame {
            WireFrame::Audio(audio) => {
                self.tutor_recorder.push_pcm(&audio.payload);
                if let Err(e) = self.playback.play(&audio) {
                    warn!(error = %e, "Dropping tutor audio");
                    self.state.note(format!("Dropped tutor audio: {e}"));
                }
            }
            WireFrame::Text(text) => match text.speaker {
                Speaker::Tutor => self.tutor_text.push_str(&text.content),
                Speaker::User => {
                    self.commit_tutor_turn();
                    let whisper = text.whisper || self.machine.whisper();
                    let audio_ref = self.last_user_clip.clone();
                    self.state
                        .push_message(text.content, Speaker::User, whisper, audio_ref);
                }
            },
            WireFrame::Control(command) => {
                match command {
                    ControlCommand::TurnComplete => {
                        self.commit_tutor_turn();
                        self.apply(SessionEvent::TurnComplete).await;
                    }
                    ControlCommand::Interrupted => {
                        self.commit_tutor_turn();
                        self.apply(SessionEvent::Interrupted).await;
                    }
                    other => debug!(command = ?other, "Ignoring inbound control"),
                }
            }
            WireFrame::FunctionCall(call) => self.dispatch_call(call).await,
            WireFrame::FunctionResult(result) => {
                debug!(call = %result.name, "Ignoring inbound function result");
            }
            WireFrame::Error(message) => {
                warn!(error = %message, "Tutor reported an error");
                self.state.connection_error = Some(message.clone());
                self.state.note(format!("Tutor error: {message}"));
            }
        }
    }

    async fn dispatch_call(&mut self, call: FunctionCallFrame) {
        let outcome = self.dispatcher.dispatch(
            &call,
            DispatchContext::new(&mut self.state, &self.clips, self.last_user_clip.as_ref()),
        );
        if let Some(result) = outcome.result().filter(|result| !result.is_ok()) {
            let reason = result.error.clone().unwrap_or_default();
            self.state
                .note(format!("Rejected {} call: {reason}", call.name));
        }

        // The answer goes out before any teardown the call triggers
        match outcome.reply {
            Reply::Ready(result) => self.send(WireFrame::FunctionResult(result)),
            Reply::AfterReplay { clip, call } => self.replay_for(call, clip),
        }

        for effect in outcome.effects {
            match effect {
                DispatchEffect::Persist(request) => {
                    fire_and_forget(self.persistence.clone(), request);
                }
                DispatchEffect::EndSession => {
                    self.commit_tutor_turn();
                    self.apply(SessionEvent::SummaryReceived).await;
                }
            }
        }
    }

    fn replay_for(&mut self, call: FunctionCallFrame, clip: ClipId) {
        match self.playback.replay(&clip) {
            Ok(handle) => {
                let inputs = self.inputs.clone();
                let shutdown = self.shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        outcome = handle => {
                            let _ = inputs.send(Input::ReplayFinished { call, outcome });
                        }
                        _ = shutdown.cancelled() => {}
                    }
                });
            }
            Err(e) => {
                let result = FunctionResultFrame::error(&call, e.to_string());
                self.send(WireFrame::FunctionResult(result));
            }
        }
    }

    fn finish_replay(&mut self, call: FunctionCallFrame, outcome: PlaybackOutcome) {
        if self.machine.is_ended() {
            self.state
                .note(format!("Replay for {} finished after the session ended", call.name));
            return;
        }
        let result = match outcome {
            PlaybackOutcome::Completed => {
                FunctionResultFrame::ok(&call, Some(json!({ "message": REPLAY_DONE_MESSAGE })))
            }
            PlaybackOutcome::Interrupted => {
                FunctionResultFrame::error(&call, "Audio playback was interrupted")
            }
            PlaybackOutcome::Failed(reason) => {
                FunctionResultFrame::error(&call, format!("Audio playback failed: {reason}"))
            }
        };
        self.send(WireFrame::FunctionResult(result));
    }

    // -------------------------------------------------------------------------
    // Transport and playback notifications
    // -------------------------------------------------------------------------

    async fn handle_transport(&mut self, event: TransportEvent) {
        if self.machine.is_ended() {
            if event != TransportEvent::Closed {
                self.state
                    .note(format!("Ignored transport event after end: {event:?}"));
            }
            return;
        }
        match event {
            TransportEvent::Opened {
                connection_id,
                reconnected,
            } => {
                info!(connection_id, reconnected, "Tutor connection open");
                self.state.connection_id = Some(connection_id);
                self.state.connection_error = None;
                self.state.can_reconnect = false;
                self.state.reconnect_attempt = None;
                self.apply(SessionEvent::TransportOpened).await;
                if !reconnected {
                    // Protocol plumbing, never shown in the conversation
                    let opening = TextFrame::user(self.settings.opening_turn.clone(), false);
                    self.send(WireFrame::Text(opening));
                }
            }
            TransportEvent::Reconnecting { attempt, delay_ms } => {
                info!(attempt, delay_ms, "Tutor connection lost; retrying");
                self.state.reconnect_attempt = Some(attempt);
                self.apply(SessionEvent::ConnectionLost).await;
            }
            TransportEvent::Failed { error, attempts } => {
                warn!(attempts, error = %error, "Tutor connection failed for good");
                self.connection_failed(error).await;
            }
            TransportEvent::Closed => debug!("Tutor connection closed"),
        }
    }

    async fn connection_failed(&mut self, error: TutorError) {
        if self.machine.is_ended() {
            return;
        }
        self.state.connection_id = None;
        self.state.connection_error = Some(error.to_string());
        self.state.can_reconnect = true;
        self.state.reconnect_attempt = None;
        self.apply(SessionEvent::ConnectFailed).await;
    }

    async fn handle_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { .. } => {
                if self.machine.is_ended() {
                    debug!("Playback started after the session ended");
                    return;
                }
                self.state.speaking = true;
                self.apply(SessionEvent::PlaybackStarted).await;
            }
            PlaybackEvent::Finished { .. } => {
                self.state.speaking = false;
                self.apply(SessionEvent::PlaybackFinished).await;
            }
        }
    }

    // -------------------------------------------------------------------------
    // Turns, timers and finalization
    // -------------------------------------------------------------------------

    fn commit_tutor_turn(&mut self) {
        let clip = self.tutor_recorder.take().map(|clip| {
            let id = clip.id.clone();
            self.clips.insert(clip);
            id
        });
        let text = std::mem::take(&mut self.tutor_text);
        let text = text.trim();
        if !text.is_empty() {
            self.state.push_message(text, Speaker::Tutor, false, clip);
        }
    }

    fn store_user_turn(&mut self) {
        let clip = self.user_recorder.lock().take();
        if let Some(clip) = clip {
            self.last_user_clip = Some(clip.id.clone());
            self.clips.insert(clip);
        }
    }

    fn arm_grace_timer(&mut self) {
        let timer = self.shutdown.child_token();
        let inputs = self.inputs.clone();
        let grace = self.settings.summary_grace;
        let cancelled = timer.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(grace) => {
                    let _ = inputs.send(Input::GraceElapsed);
                }
                _ = cancelled.cancelled() => {}
            }
        });
        if let Some(previous) = self.grace.replace(timer) {
            previous.cancel();
        }
        debug!(grace_secs = grace.as_secs(), "Summary grace timer armed");
    }

    fn finalize(&mut self, reason: EndReason) {
        self.commit_tutor_turn();
        self.capture.abort();
        self.tick_practice_clock();
        self.state.end_reason = Some(reason);
        if reason == EndReason::TimedOut {
            let timeout = TutorError::SessionTimeout(self.settings.summary_grace.as_secs());
            self.state.note(timeout.to_string());
        }

        if let Some(summary) = self.state.summary.clone() {
            fire_and_forget(self.persistence.clone(), PersistRequest::Summary(summary));
        }
        let seconds = self.state.practice_seconds;
        if seconds > 0 {
            fire_and_forget(
                self.persistence.clone(),
                PersistRequest::PracticeTime { seconds },
            );
        }
        info!(reason = %reason, practice_seconds = seconds, "Session ended");
    }

    /// Active time is connected, unpaused time before the end.
    fn tick_practice_clock(&mut self) {
        let phase = self.machine.phase();
        let active = !self.machine.is_ended() && phase.is_connected() && !phase.is_paused();
        let now = Instant::now();
        match (active, self.active_since) {
            (true, None) => self.active_since = Some(now),
            (false, Some(since)) => {
                self.practiced += now - since;
                self.active_since = None;
            }
            _ => {}
        }
        let running = self
            .active_since
            .map(|since| now - since)
            .unwrap_or_default();
        self.state.practice_seconds = (self.practiced + running).as_secs();
    }

    fn publish(&mut self) {
        self.sync_gate();
        self.tick_practice_clock();

        let phase = self.machine.phase();
        self.state.phase = phase.kind();
        self.state.muted = phase.is_muted();
        self.state.paused = phase.is_paused();
        self.state.listening = *phase.base() == SessionPhase::Listening;
        self.state.whisper = self.machine.whisper();
        self.state.awaiting_summary = self.machine.awaiting_summary();
        if self.machine.is_ended() {
            self.state.can_reconnect = false;
            self.state.end_reason = self.machine.end_reason();
        }
        self.publisher.send_replace(self.state.clone());
    }

    fn send(&self, frame: WireFrame) {
        let kind = frame.kind();
        match self.transport.send(frame) {
            Ok(()) => {}
            Err(TutorError::NotConnected) => debug!(kind, "Offline; frame not sent"),
            Err(e) => warn!(kind, error = %e, "Failed to send frame"),
        }
    }
}
