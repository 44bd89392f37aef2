//! Tutor audio playback pipeline.
//!
//! [`AudioPlayback`] decodes inbound audio frames and renders them on an
//! [`OutputDevice`], one job at a time, from a single worker task. Live frames
//! queue behind each other so a streamed answer plays gap-free; a replay
//! interrupts whatever is playing first.
//!
//! # Interruption
//!
//! Every job carries the cancellation token that was current when it was
//! queued. [`AudioPlayback::interrupt`] cancels that token and installs a fresh
//! one synchronously, so the playing job and everything queued behind it
//! resolve as [`PlaybackOutcome::Interrupted`] without waiting for the worker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::clips::{AudioClip, ClipId, ClipStore};
use super::devices::OutputDevice;
use super::format::{PcmFormat, decode_pcm16};
use crate::core::transport::{AudioFrame, Listeners, Subscription};
use crate::errors::{TutorError, TutorResult};

/// What a playback job is playing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackSource {
    /// Audio streamed from the tutor
    Live,
    /// A stored clip
    Replay(ClipId),
}

/// How a playback job ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackOutcome {
    /// Played to the end
    Completed,
    /// Cut short by an interruption or a replay
    Interrupted,
    /// The output device failed
    Failed(String),
}

/// Playback lifecycle notifications.
///
/// `Started` fires when the output goes from silent to audible. `Finished`
/// fires when it goes silent again: the queue drained, or an interruption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// Output became audible
    Started {
        /// Source of the first job played
        source: PlaybackSource,
    },
    /// Output went silent
    Finished {
        /// Source of the last job played
        source: PlaybackSource,
        /// Outcome of the last job played
        outcome: PlaybackOutcome,
    },
}

/// Callback type for playback events.
pub type PlaybackListener = Arc<dyn Fn(PlaybackEvent) + Send + Sync>;

/// Resolves with the outcome of one queued playback.
///
/// It always resolves: a job dropped by a shutdown counts as interrupted.
#[must_use = "a playback handle does nothing unless awaited or dropped"]
pub struct PlaybackHandle {
    rx: oneshot::Receiver<PlaybackOutcome>,
}

impl Future for PlaybackHandle {
    type Output = PlaybackOutcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(PlaybackOutcome::Interrupted),
            Poll::Pending => Poll::Pending,
        }
    }
}

struct Job {
    samples: Arc<[i16]>,
    format: PcmFormat,
    source: PlaybackSource,
    token: CancellationToken,
    done: oneshot::Sender<PlaybackOutcome>,
}

/// Single-context playback pipeline.
pub struct AudioPlayback {
    output: Arc<dyn OutputDevice>,
    default_format: PcmFormat,
    clips: ClipStore,
    queue: mpsc::UnboundedSender<Job>,
    generation: Mutex<CancellationToken>,
    listeners: Arc<Listeners<PlaybackEvent>>,
    playing: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl AudioPlayback {
    /// Start a playback worker on `output`.
    ///
    /// Frames without a rate parameter are assumed to be in `default_format`.
    /// Must be called from within a tokio runtime.
    pub fn new(output: Arc<dyn OutputDevice>, default_format: PcmFormat, clips: ClipStore) -> Self {
        let (queue, rx) = mpsc::unbounded_channel();
        let listeners = Arc::new(Listeners::new());
        let playing = Arc::new(AtomicBool::new(false));

        let worker = tokio::spawn(run_worker(
            rx,
            output.clone(),
            listeners.clone(),
            playing.clone(),
        ));

        Self {
            output,
            default_format,
            clips,
            queue,
            generation: Mutex::new(CancellationToken::new()),
            listeners,
            playing,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Register a playback event listener.
    pub fn on_event(&self, listener: PlaybackListener) -> Subscription {
        let id = self.listeners.add(listener);
        Subscription::new(&self.listeners, id)
    }

    /// Clip store used by [`AudioPlayback::replay`].
    pub fn clips(&self) -> &ClipStore {
        &self.clips
    }

    /// Queue a live frame behind anything already playing.
    pub fn play(&self, frame: &AudioFrame) -> TutorResult<PlaybackHandle> {
        let format = PcmFormat::from_mime(&frame.mime, self.default_format.sample_rate)
            .ok_or_else(|| {
                TutorError::MalformedFrame(format!("unsupported audio mime '{}'", frame.mime))
            })?;
        let samples: Arc<[i16]> = decode_pcm16(&frame.payload).into();
        self.enqueue(samples, format, PlaybackSource::Live)
    }

    /// Replay a stored clip, interrupting any current playback.
    pub fn replay(&self, id: &ClipId) -> TutorResult<PlaybackHandle> {
        let clip = self
            .clips
            .get(id)
            .ok_or_else(|| TutorError::Internal(format!("no stored clip '{id}'")))?;
        self.replay_clip(clip)
    }

    /// Replay a clip that is not necessarily stored.
    pub fn replay_clip(&self, clip: AudioClip) -> TutorResult<PlaybackHandle> {
        self.interrupt();
        debug!(clip = %clip.id, "Replaying clip");
        self.enqueue(clip.samples, clip.format, PlaybackSource::Replay(clip.id))
    }

    /// Stop the current playback and drop everything queued.
    pub fn interrupt(&self) {
        let previous = std::mem::replace(&mut *self.generation.lock(), CancellationToken::new());
        previous.cancel();
        self.output.halt();
    }

    /// Whether audio is currently audible.
    pub fn is_playing(&self) -> bool {
        self.playing.load(Ordering::SeqCst)
    }

    /// Interrupt and stop the worker. Further calls to `play` fail.
    pub fn shutdown(&self) {
        self.interrupt();
        if let Some(worker) = self.worker.lock().take() {
            worker.abort();
            info!("Audio playback shut down");
        }
        self.playing.store(false, Ordering::SeqCst);
        self.listeners.clear();
    }

    fn enqueue(
        &self,
        samples: Arc<[i16]>,
        format: PcmFormat,
        source: PlaybackSource,
    ) -> TutorResult<PlaybackHandle> {
        if self.worker.lock().is_none() {
            return Err(TutorError::Internal("playback is shut down".to_string()));
        }
        let (done, rx) = oneshot::channel();
        let job = Job {
            samples,
            format,
            source,
            token: self.generation.lock().clone(),
            done,
        };
        self.queue
            .send(job)
            .map_err(|_| TutorError::Internal("playback worker stopped".to_string()))?;
        Ok(PlaybackHandle { rx })
    }
}

impl Drop for AudioPlayback {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    output: Arc<dyn OutputDevice>,
    listeners: Arc<Listeners<PlaybackEvent>>,
    playing: Arc<AtomicBool>,
) {
    while let Some(job) = rx.recv().await {
        if job.token.is_cancelled() {
            let _ = job.done.send(PlaybackOutcome::Interrupted);
            continue;
        }

        if !playing.swap(true, Ordering::SeqCst) {
            listeners.emit(PlaybackEvent::Started {
                source: job.source.clone(),
            });
        }

        let outcome = tokio::select! {
            _ = job.token.cancelled() => PlaybackOutcome::Interrupted,
            result = output.render(&job.samples, job.format) => match result {
                Ok(()) => PlaybackOutcome::Completed,
                Err(e) => {
                    warn!("Playback failed: {}", e);
                    PlaybackOutcome::Failed(e.to_string())
                }
            },
        };

        let next_is_live = !rx.is_empty() && outcome == PlaybackOutcome::Completed;
        if !next_is_live {
            playing.store(false, Ordering::SeqCst);
            listeners.emit(PlaybackEvent::Finished {
                source: job.source.clone(),
                outcome: outcome.clone(),
            });
        }
        let _ = job.done.send(outcome);
    }
}
