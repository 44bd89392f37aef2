//! Microphone capture pipeline.
//!
//! [`AudioCapture`] opens an [`InputDevice`], cuts its sample stream into
//! fixed-length PCM16 chunks and pushes each chunk to a callback as soon as it
//! is complete. Nothing is buffered beyond the chunk being assembled; the
//! callback decides whether a chunk is sent or dropped.
//!
//! The device is held by a [`DeviceLease`] owned by the pump task, so it is
//! released on every exit path: a graceful `stop`, an `abort`, input running
//! dry, or the task being torn down.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::devices::{InputDevice, SampleReceiver};
use super::format::{AudioConfig, encode_pcm16};
use crate::errors::TutorResult;

/// Receives encoded PCM16 chunks.
pub type ChunkHandler = Arc<dyn Fn(Bytes) + Send + Sync>;

type SharedDevice = Arc<Mutex<Box<dyn InputDevice>>>;

/// Scoped ownership of an opened input device.
pub struct DeviceLease {
    device: SharedDevice,
}

impl Drop for DeviceLease {
    fn drop(&mut self) {
        self.device.lock().close();
        debug!("Input device released");
    }
}

struct ActiveCapture {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

/// Capture pipeline with an independent start/stop lifecycle.
pub struct AudioCapture {
    config: AudioConfig,
    device: SharedDevice,
    active: Mutex<Option<ActiveCapture>>,
}

impl AudioCapture {
    /// Pipeline reading from `device`.
    pub fn new(config: AudioConfig, device: Box<dyn InputDevice>) -> Self {
        Self {
            config,
            device: Arc::new(Mutex::new(device)),
            active: Mutex::new(None),
        }
    }

    /// Audio settings.
    pub fn config(&self) -> &AudioConfig {
        &self.config
    }

    /// Acquire the device and start delivering chunks to `on_chunk`.
    ///
    /// Fails with [`TutorError::AudioDevice`](crate::errors::TutorError::AudioDevice)
    /// when the device cannot be opened. Calling it while already capturing is a
    /// no-op.
    pub async fn start(&self, on_chunk: ChunkHandler) -> TutorResult<()> {
        let mut active = self.active.lock();
        if let Some(current) = active.as_ref() {
            if !current.task.is_finished() {
                return Ok(());
            }
        }

        let format = self.config.input_format();
        let samples = self.device.lock().open(format)?;
        let lease = DeviceLease {
            device: self.device.clone(),
        };

        let chunk_len = self.config.samples_per_chunk().max(1);
        let stop = CancellationToken::new();
        let task = tokio::spawn(pump(samples, chunk_len, on_chunk, stop.clone(), lease));

        info!(
            sample_rate = format.sample_rate,
            chunk_len, "Audio capture started"
        );
        *active = Some(ActiveCapture { stop, task });
        Ok(())
    }

    /// Flush the chunk in progress, release the device and wait for the pump
    /// to finish. Idempotent.
    pub async fn stop(&self) {
        let Some(active) = self.active.lock().take() else {
            return;
        };
        active.stop.cancel();
        if let Err(e) = active.task.await {
            if !e.is_cancelled() {
                warn!("Capture task failed: {}", e);
            }
        }
        info!("Audio capture stopped");
    }

    /// Stop immediately without flushing. Idempotent.
    pub fn abort(&self) {
        if let Some(active) = self.active.lock().take() {
            active.stop.cancel();
            active.task.abort();
            info!("Audio capture aborted");
        }
    }

    /// Whether chunks are currently being produced.
    pub fn is_active(&self) -> bool {
        self.active
            .lock()
            .as_ref()
            .is_some_and(|active| !active.task.is_finished())
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.abort();
    }
}

async fn pump(
    mut samples: SampleReceiver,
    chunk_len: usize,
    on_chunk: ChunkHandler,
    stop: CancellationToken,
    _lease: DeviceLease,
) {
    let mut pending: Vec<i16> = Vec::with_capacity(chunk_len);

    let emit_full = |pending: &mut Vec<i16>| {
        while pending.len() >= chunk_len {
            let chunk: Vec<i16> = pending.drain(..chunk_len).collect();
            on_chunk(encode_pcm16(&chunk));
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => {
                // Drain whatever the device already produced
                while let Ok(block) = samples.try_recv() {
                    pending.extend_from_slice(&block);
                }
                break;
            }
            block = samples.recv() => match block {
                Some(block) => {
                    pending.extend_from_slice(&block);
                    emit_full(&mut pending);
                }
                None => {
                    debug!("Input stream ended");
                    break;
                }
            },
        }
    }

    emit_full(&mut pending);
    if !pending.is_empty() {
        on_chunk(encode_pcm16(&pending));
    }
}
