//! Audio capture and playback pipelines.
//!
//! # Audio Format
//!
//! - Microphone: PCM 16-bit signed little-endian mono, 16 kHz, 100 ms chunks
//! - Tutor: PCM 16-bit signed little-endian mono, 24 kHz
//!
//! Rates are configurable per direction through [`AudioConfig`].

mod capture;
mod clips;
mod devices;
mod format;
#[cfg(feature = "native-audio")]
mod native;
mod playback;

pub use capture::{AudioCapture, ChunkHandler, DeviceLease};
pub use clips::{AudioClip, ClipId, ClipStore, TurnRecorder};
pub use devices::{
    InputDevice, InputFeeder, NullInput, NullOutput, OutputDevice, OutputRecorder, SampleReceiver,
    ScriptedInput, SimulatedOutput, WavFileInput, WavFileOutput,
};
pub use format::{
    AudioConfig, DEFAULT_CHUNK_DURATION_MS, DEFAULT_INPUT_SAMPLE_RATE, DEFAULT_OUTPUT_SAMPLE_RATE,
    PcmFormat, decode_pcm16, encode_pcm16, f32_to_i16,
};
#[cfg(feature = "native-audio")]
pub use native::{CpalInput, RodioOutput};
pub use playback::{
    AudioPlayback, PlaybackEvent, PlaybackHandle, PlaybackListener, PlaybackOutcome,
    PlaybackSource,
};
