//! Audio device abstractions.
//!
//! Capture reads from an [`InputDevice`], playback renders to an
//! [`OutputDevice`]. Besides the host devices behind the `native-audio`
//! feature, this module ships file-backed devices (`hound`) and scripted ones
//! for tests and headless runs.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::format::{DEFAULT_CHUNK_DURATION_MS, PcmFormat};
use crate::errors::{TutorError, TutorResult};

/// Blocks of samples produced by an open input device.
pub type SampleReceiver = mpsc::UnboundedReceiver<Vec<i16>>;

/// A microphone-like sample source.
///
/// `open` acquires the device and returns a stream of sample blocks. The stream
/// ends when the device is closed or runs out of input.
pub trait InputDevice: Send {
    /// Acquire the device.
    fn open(&mut self, format: PcmFormat) -> TutorResult<SampleReceiver>;

    /// Release the device. Safe to call when already closed.
    fn close(&mut self);
}

/// A speaker-like sample sink.
#[async_trait]
pub trait OutputDevice: Send + Sync {
    /// Play samples, resolving once they have been rendered.
    ///
    /// Dropping the returned future abandons the rest of the buffer.
    async fn render(&self, samples: &[i16], format: PcmFormat) -> TutorResult<()>;

    /// Stop whatever is currently audible.
    fn halt(&self);
}

// =============================================================================
// Scripted input
// =============================================================================

#[derive(Default)]
struct FeedSlot {
    sender: Mutex<Option<mpsc::UnboundedSender<Vec<i16>>>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// Input device driven by an [`InputFeeder`].
pub struct ScriptedInput {
    slot: Arc<FeedSlot>,
    unavailable: bool,
}

/// Handle that pushes samples into a [`ScriptedInput`].
#[derive(Clone)]
pub struct InputFeeder {
    slot: Arc<FeedSlot>,
}

impl ScriptedInput {
    /// Create a device and its feeder.
    pub fn new() -> (Self, InputFeeder) {
        let slot = Arc::new(FeedSlot::default());
        (
            Self {
                slot: slot.clone(),
                unavailable: false,
            },
            InputFeeder { slot },
        )
    }

    /// A device whose `open` always fails, as a busy microphone would.
    pub fn unavailable() -> (Self, InputFeeder) {
        let (mut device, feeder) = Self::new();
        device.unavailable = true;
        (device, feeder)
    }
}

impl InputDevice for ScriptedInput {
    fn open(&mut self, _format: PcmFormat) -> TutorResult<SampleReceiver> {
        if self.unavailable {
            return Err(TutorError::AudioDevice(
                "microphone is not available".to_string(),
            ));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.slot.sender.lock() = Some(tx);
        self.slot.opens.fetch_add(1, Ordering::SeqCst);
        Ok(rx)
    }

    fn close(&mut self) {
        if self.slot.sender.lock().take().is_some() {
            self.slot.closes.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl InputFeeder {
    /// Push a block of samples. Returns `false` when the device is closed.
    pub fn push(&self, samples: Vec<i16>) -> bool {
        match self.slot.sender.lock().as_ref() {
            Some(tx) => tx.send(samples).is_ok(),
            None => false,
        }
    }

    /// End the input stream as if the source ran dry.
    pub fn finish(&self) {
        self.slot.sender.lock().take();
    }

    /// Whether the device is currently open.
    pub fn is_open(&self) -> bool {
        self.slot.sender.lock().is_some()
    }

    /// Times the device was opened.
    pub fn open_count(&self) -> usize {
        self.slot.opens.load(Ordering::SeqCst)
    }

    /// Times the device was released.
    pub fn close_count(&self) -> usize {
        self.slot.closes.load(Ordering::SeqCst)
    }
}

/// Input with no microphone behind it. `open` always fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullInput;

impl InputDevice for NullInput {
    fn open(&mut self, _format: PcmFormat) -> TutorResult<SampleReceiver> {
        Err(TutorError::AudioDevice(
            "no input device configured".to_string(),
        ))
    }

    fn close(&mut self) {}
}

// =============================================================================
// WAV file input
// =============================================================================

/// Input device that streams a WAV file.
///
/// The file must be 16-bit integer PCM at the capture rate. Multi-channel
/// files are reduced to their first channel. With `realtime` set, blocks are
/// paced at playback speed so the remote side hears a natural stream.
pub struct WavFileInput {
    path: PathBuf,
    realtime: bool,
    block_ms: u32,
    cancel: Option<CancellationToken>,
}

impl WavFileInput {
    /// Stream `path`, paced at real time.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            realtime: true,
            block_ms: DEFAULT_CHUNK_DURATION_MS,
            cancel: None,
        }
    }

    /// Deliver the whole file as fast as the consumer reads it.
    pub fn unpaced(mut self) -> Self {
        self.realtime = false;
        self
    }

    fn read_samples(&self, format: PcmFormat) -> TutorResult<Vec<i16>> {
        let reader = hound::WavReader::open(&self.path).map_err(|e| {
            TutorError::AudioDevice(format!("Failed to open {}: {e}", self.path.display()))
        })?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(TutorError::AudioDevice(format!(
                "{} is not 16-bit PCM",
                self.path.display()
            )));
        }
        if spec.sample_rate != format.sample_rate {
            return Err(TutorError::AudioDevice(format!(
                "{} is {} Hz, capture expects {} Hz",
                self.path.display(),
                spec.sample_rate,
                format.sample_rate
            )));
        }

        let channels = usize::from(spec.channels.max(1));
        let samples = reader
            .into_samples::<i16>()
            .filter_map(Result::ok)
            .step_by(channels)
            .collect();
        Ok(samples)
    }
}

impl InputDevice for WavFileInput {
    fn open(&mut self, format: PcmFormat) -> TutorResult<SampleReceiver> {
        let samples = self.read_samples(format)?;
        let block = format.samples_for(self.block_ms).max(1);
        let pace = format.duration_of(block);
        let realtime = self.realtime;

        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();
        self.cancel = Some(token.clone());

        info!(path = %self.path.display(), samples = samples.len(), "Streaming WAV input");
        tokio::spawn(async move {
            for chunk in samples.chunks(block) {
                if token.is_cancelled() || tx.send(chunk.to_vec()).is_err() {
                    return;
                }
                if realtime {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(pace) => {}
                    }
                }
            }
            debug!("WAV input exhausted");
        });
        Ok(rx)
    }

    fn close(&mut self) {
        if let Some(token) = self.cancel.take() {
            token.cancel();
        }
    }
}

// =============================================================================
// Outputs
// =============================================================================

/// Observations made by a [`SimulatedOutput`].
#[derive(Debug, Default)]
pub struct OutputRecorder {
    rendered: Mutex<Vec<usize>>,
    completed: AtomicUsize,
    halts: AtomicUsize,
}

impl OutputRecorder {
    /// Sample counts of every render that started.
    pub fn rendered(&self) -> Vec<usize> {
        self.rendered.lock().clone()
    }

    /// Renders that ran to completion.
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Calls to `halt`.
    pub fn halts(&self) -> usize {
        self.halts.load(Ordering::SeqCst)
    }
}

/// Output that takes as long as the audio would, without making a sound.
///
/// Uses the tokio clock, so tests with a paused clock run instantly.
#[derive(Default)]
pub struct SimulatedOutput {
    recorder: Arc<OutputRecorder>,
}

impl SimulatedOutput {
    /// New simulated output.
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared recorder for assertions.
    pub fn recorder(&self) -> Arc<OutputRecorder> {
        self.recorder.clone()
    }
}

#[async_trait]
impl OutputDevice for SimulatedOutput {
    async fn render(&self, samples: &[i16], format: PcmFormat) -> TutorResult<()> {
        self.recorder.rendered.lock().push(samples.len());
        tokio::time::sleep(format.duration_of(samples.len())).await;
        self.recorder.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn halt(&self) {
        self.recorder.halts.fetch_add(1, Ordering::SeqCst);
    }
}

/// Output that discards audio immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullOutput;

#[async_trait]
impl OutputDevice for NullOutput {
    async fn render(&self, _samples: &[i16], _format: PcmFormat) -> TutorResult<()> {
        Ok(())
    }

    fn halt(&self) {}
}

type WavSink = hound::WavWriter<BufWriter<File>>;

/// Output that appends everything rendered to a WAV file.
///
/// The file is created on the first render, using that render's format.
/// Renders with a different sample rate are rejected.
pub struct WavFileOutput {
    path: PathBuf,
    writer: Mutex<Option<(WavSink, u32)>>,
    finalized: AtomicBool,
}

impl WavFileOutput {
    /// Write to `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            writer: Mutex::new(None),
            finalized: AtomicBool::new(false),
        }
    }

    /// Target path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush the WAV header. Further renders are rejected.
    pub fn finalize(&self) -> TutorResult<()> {
        self.finalized.store(true, Ordering::SeqCst);
        match self.writer.lock().take() {
            Some((writer, _)) => writer
                .finalize()
                .map_err(|e| TutorError::AudioDevice(format!("Failed to finalize WAV: {e}"))),
            None => Ok(()),
        }
    }

    fn append(&self, samples: &[i16], format: PcmFormat) -> TutorResult<()> {
        if self.finalized.load(Ordering::SeqCst) {
            return Err(TutorError::AudioDevice("WAV output already finalized".to_string()));
        }
        let mut guard = self.writer.lock();
        if guard.is_none() {
            let spec = hound::WavSpec {
                channels: format.channels,
                sample_rate: format.sample_rate,
                bits_per_sample: 16,
                sample_format: hound::SampleFormat::Int,
            };
            let writer = hound::WavWriter::create(&self.path, spec).map_err(|e| {
                TutorError::AudioDevice(format!("Failed to create {}: {e}", self.path.display()))
            })?;
            *guard = Some((writer, format.sample_rate));
        }

        let Some((writer, rate)) = guard.as_mut() else {
            return Err(TutorError::Internal("WAV writer missing".to_string()));
        };
        if *rate != format.sample_rate {
            return Err(TutorError::AudioDevice(format!(
                "WAV output is {} Hz, got {} Hz audio",
                rate, format.sample_rate
            )));
        }
        for &sample in samples {
            writer
                .write_sample(sample)
                .map_err(|e| TutorError::AudioDevice(format!("Failed to write WAV: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl OutputDevice for WavFileOutput {
    async fn render(&self, samples: &[i16], format: PcmFormat) -> TutorResult<()> {
        self.append(samples, format)
    }

    fn halt(&self) {}
}

impl Drop for WavFileOutput {
    fn drop(&mut self) {
        if let Err(e) = self.finalize() {
            warn!("{}", e);
        }
    }
}
