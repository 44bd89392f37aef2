//! Host audio devices (microphone via CPAL, speaker via Rodio).
//!
//! Both libraries hand out stream handles that must stay on the thread that
//! created them, so each device runs its stream on a dedicated thread and
//! talks to it over channels.

use std::sync::mpsc as std_mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use rodio::{OutputStream, Sink};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use super::devices::{InputDevice, OutputDevice, SampleReceiver};
use super::format::{PcmFormat, f32_to_i16};
use crate::errors::{TutorError, TutorResult};

const SPEAKER_POLL_INTERVAL: Duration = Duration::from_millis(10);

fn device_error(e: impl std::fmt::Display) -> TutorError {
    TutorError::AudioDevice(e.to_string())
}

// =============================================================================
// Microphone
// =============================================================================

/// Default input device of the host.
#[derive(Default)]
pub struct CpalInput {
    stop: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl CpalInput {
    /// Microphone handle; nothing is acquired until `open`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the host's input devices.
    pub fn list_devices() -> TutorResult<Vec<String>> {
        let devices = cpal::default_host().input_devices().map_err(device_error)?;
        Ok(devices.filter_map(|device| device.name().ok()).collect())
    }
}

fn build_input_stream(
    format: PcmFormat,
    tx: mpsc::UnboundedSender<Vec<i16>>,
) -> TutorResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| TutorError::AudioDevice("No input device available".to_string()))?;
    info!(
        device = %device.name().unwrap_or_else(|_| "Unknown".to_string()),
        sample_rate = format.sample_rate,
        "Opening microphone"
    );

    let config = cpal::StreamConfig {
        channels: format.channels,
        sample_rate: cpal::SampleRate(format.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };
    let stream = device
        .build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                let block: Vec<i16> = data.iter().map(|&sample| f32_to_i16(sample)).collect();
                // Receiver gone means capture stopped
                let _ = tx.send(block);
            },
            |err| warn!("Microphone stream error: {}", err),
            None,
        )
        .map_err(device_error)?;
    stream.play().map_err(device_error)?;
    Ok(stream)
}

impl InputDevice for CpalInput {
    fn open(&mut self, format: PcmFormat) -> TutorResult<SampleReceiver> {
        self.close();

        let (tx, rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel::<TutorResult<()>>(1);
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let thread = std::thread::Builder::new()
            .name("tutor-microphone".to_string())
            .spawn(move || {
                let stream = match build_input_stream(format, tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until close() signals or drops the sender
                let _ = stop_rx.recv();
                drop(stream);
            })
            .map_err(device_error)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.stop = Some(stop_tx);
                self.thread = Some(thread);
                Ok(rx)
            }
            Ok(Err(e)) => {
                let _ = thread.join();
                Err(e)
            }
            Err(_) => Err(TutorError::AudioDevice(
                "microphone thread exited before the stream started".to_string(),
            )),
        }
    }

    fn close(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
            info!("Microphone released");
        }
    }
}

impl Drop for CpalInput {
    fn drop(&mut self) {
        self.close();
    }
}

// =============================================================================
// Speaker
// =============================================================================

enum SpeakerCommand {
    Play {
        samples: Vec<i16>,
        sample_rate: u32,
        done: oneshot::Sender<()>,
    },
    Halt,
}

/// Default output device of the host.
pub struct RodioOutput {
    commands: std_mpsc::Sender<SpeakerCommand>,
    _thread: JoinHandle<()>,
}

fn run_speaker(
    commands: std_mpsc::Receiver<SpeakerCommand>,
    ready: std_mpsc::SyncSender<TutorResult<()>>,
) {
    let opened = OutputStream::try_default()
        .map_err(device_error)
        .and_then(|(stream, handle)| {
            Sink::try_new(&handle)
                .map(|sink| (stream, handle, sink))
                .map_err(device_error)
        });
    let (_stream, handle, mut sink) = match opened {
        Ok(parts) => parts,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let mut pending: Vec<oneshot::Sender<()>> = Vec::new();
    loop {
        match commands.recv_timeout(SPEAKER_POLL_INTERVAL) {
            Ok(SpeakerCommand::Play {
                samples,
                sample_rate,
                done,
            }) => {
                sink.append(rodio::buffer::SamplesBuffer::new(1, sample_rate, samples));
                pending.push(done);
            }
            Ok(SpeakerCommand::Halt) => {
                sink.stop();
                pending.clear();
                match Sink::try_new(&handle) {
                    Ok(fresh) => sink = fresh,
                    Err(e) => {
                        warn!("Failed to recreate speaker sink: {}", e);
                        return;
                    }
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => return,
        }
        if sink.empty() {
            for done in pending.drain(..) {
                let _ = done.send(());
            }
        }
    }
}

impl RodioOutput {
    /// Open the default output device.
    pub fn new() -> TutorResult<Self> {
        let (tx, rx) = std_mpsc::channel();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);
        let thread = std::thread::Builder::new()
            .name("tutor-speaker".to_string())
            .spawn(move || run_speaker(rx, ready_tx))
            .map_err(device_error)?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                info!("Speaker ready");
                Ok(Self {
                    commands: tx,
                    _thread: thread,
                })
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TutorError::AudioDevice(
                "speaker thread exited during startup".to_string(),
            )),
        }
    }
}

#[async_trait]
impl OutputDevice for RodioOutput {
    async fn render(&self, samples: &[i16], format: PcmFormat) -> TutorResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.commands
            .send(SpeakerCommand::Play {
                samples: samples.to_vec(),
                sample_rate: format.sample_rate,
                done: done_tx,
            })
            .map_err(|_| TutorError::AudioDevice("speaker is closed".to_string()))?;
        // A halt drops the sender, which also ends the wait
        let _ = done_rx.await;
        Ok(())
    }

    fn halt(&self) {
        let _ = self.commands.send(SpeakerCommand::Halt);
    }
}

impl Drop for RodioOutput {
    fn drop(&mut self) {
        // The thread exits once the command sender is gone
        let _ = self.commands.send(SpeakerCommand::Halt);
    }
}
