//! Stored audio clips.
//!
//! Every completed turn's audio is kept in a [`ClipStore`] so it can be
//! replayed later in the session: the tutor's last answer, the learner's own
//! sentence attached to a struggle record, or a clip preloaded for a review
//! lesson.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use super::format::{PcmFormat, decode_pcm16};
use crate::errors::{TutorError, TutorResult};

/// Identifier of a stored clip.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClipId(String);

impl ClipId {
    /// Wrap an existing identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh random identifier.
    pub fn generate() -> Self {
        Self(format!("clip-{}", uuid::Uuid::new_v4()))
    }

    /// Identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClipId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Immutable PCM16 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioClip {
    /// Clip identifier
    pub id: ClipId,
    /// Sample format
    pub format: PcmFormat,
    /// Samples, shared with any playback using them
    pub samples: Arc<[i16]>,
}

impl AudioClip {
    /// Clip from decoded samples.
    pub fn new(id: ClipId, format: PcmFormat, samples: Vec<i16>) -> Self {
        Self {
            id,
            format,
            samples: samples.into(),
        }
    }

    /// Clip from little-endian PCM16 bytes.
    pub fn from_pcm(id: ClipId, format: PcmFormat, bytes: &[u8]) -> Self {
        Self::new(id, format, decode_pcm16(bytes))
    }

    /// Clip from a 16-bit PCM WAV file.
    pub fn from_wav_file(id: ClipId, path: impl AsRef<Path>) -> TutorResult<Self> {
        let path = path.as_ref();
        let reader = hound::WavReader::open(path).map_err(|e| {
            TutorError::AudioDevice(format!("Failed to open {}: {e}", path.display()))
        })?;
        let spec = reader.spec();
        if spec.sample_format != hound::SampleFormat::Int || spec.bits_per_sample != 16 {
            return Err(TutorError::AudioDevice(format!(
                "{} is not 16-bit PCM",
                path.display()
            )));
        }
        let channels = usize::from(spec.channels.max(1));
        let samples = reader
            .into_samples::<i16>()
            .filter_map(Result::ok)
            .step_by(channels)
            .collect();
        Ok(Self::new(id, PcmFormat::mono(spec.sample_rate), samples))
    }

    /// Playback length.
    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }

    /// Whether the clip holds no audio.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Concurrent clip registry. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct ClipStore {
    clips: Arc<DashMap<ClipId, AudioClip>>,
}

impl ClipStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a clip, replacing any clip with the same id.
    pub fn insert(&self, clip: AudioClip) {
        self.clips.insert(clip.id.clone(), clip);
    }

    /// Look up a clip.
    pub fn get(&self, id: &ClipId) -> Option<AudioClip> {
        self.clips.get(id).map(|entry| entry.value().clone())
    }

    /// Whether a clip is stored.
    pub fn contains(&self, id: &ClipId) -> bool {
        self.clips.contains_key(id)
    }

    /// Remove a clip.
    pub fn remove(&self, id: &ClipId) -> Option<AudioClip> {
        self.clips.remove(id).map(|(_, clip)| clip)
    }

    /// Number of stored clips.
    pub fn len(&self) -> usize {
        self.clips.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.clips.is_empty()
    }

    /// Drop every clip.
    pub fn clear(&self) {
        self.clips.clear();
    }
}

/// Accumulates one turn's audio.
#[derive(Debug, Clone)]
pub struct TurnRecorder {
    format: PcmFormat,
    samples: Vec<i16>,
}

impl TurnRecorder {
    /// Recorder for audio in `format`.
    pub fn new(format: PcmFormat) -> Self {
        Self {
            format,
            samples: Vec::new(),
        }
    }

    /// Append little-endian PCM16 bytes.
    pub fn push_pcm(&mut self, bytes: &[u8]) {
        self.samples.extend(decode_pcm16(bytes));
    }

    /// Whether nothing was recorded since the last take.
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Discard the recording.
    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// Close the turn, returning its clip if any audio was recorded.
    pub fn take(&mut self) -> Option<AudioClip> {
        if self.samples.is_empty() {
            return None;
        }
        let samples = std::mem::take(&mut self.samples);
        Some(AudioClip::new(ClipId::generate(), self.format, samples))
    }
}
