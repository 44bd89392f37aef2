//! PCM wire format helpers.
//!
//! All audio on the wire is 16-bit signed little-endian mono PCM. The sample
//! rate is fixed per direction at handshake time: microphone audio goes out at
//! the input rate, tutor audio comes back at the output rate.

use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::core::transport::PCM_MIME_PREFIX;

/// Default sample rate of captured microphone audio.
pub const DEFAULT_INPUT_SAMPLE_RATE: u32 = 16000;

/// Default sample rate of tutor audio.
pub const DEFAULT_OUTPUT_SAMPLE_RATE: u32 = 24000;

/// Default capture chunk length.
pub const DEFAULT_CHUNK_DURATION_MS: u32 = 100;

/// Audio settings negotiated for a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Microphone sample rate in Hz
    pub input_sample_rate: u32,
    /// Tutor audio sample rate in Hz
    pub output_sample_rate: u32,
    /// Length of one capture chunk
    pub chunk_duration_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            input_sample_rate: DEFAULT_INPUT_SAMPLE_RATE,
            output_sample_rate: DEFAULT_OUTPUT_SAMPLE_RATE,
            chunk_duration_ms: DEFAULT_CHUNK_DURATION_MS,
        }
    }
}

impl AudioConfig {
    /// Format of outbound audio.
    pub fn input_format(&self) -> PcmFormat {
        PcmFormat::mono(self.input_sample_rate)
    }

    /// Format of inbound audio.
    pub fn output_format(&self) -> PcmFormat {
        PcmFormat::mono(self.output_sample_rate)
    }

    /// Samples in one capture chunk.
    pub fn samples_per_chunk(&self) -> usize {
        self.input_format().samples_for(self.chunk_duration_ms)
    }
}

/// Shape of a PCM16 stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmFormat {
    /// Sample rate in Hz
    pub sample_rate: u32,
    /// Channel count
    pub channels: u16,
}

impl PcmFormat {
    /// Mono stream at `sample_rate`.
    pub fn mono(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            channels: 1,
        }
    }

    /// Mime type, e.g. `audio/pcm;rate=16000`.
    pub fn mime(&self) -> String {
        format!("{PCM_MIME_PREFIX};rate={}", self.sample_rate)
    }

    /// Parse a PCM mime type, falling back to `default_rate` when the rate
    /// parameter is missing.
    pub fn from_mime(mime: &str, default_rate: u32) -> Option<Self> {
        let mut parts = mime.split(';');
        let base = parts.next()?.trim();
        if !base.eq_ignore_ascii_case(PCM_MIME_PREFIX) {
            return None;
        }
        let rate = parts
            .filter_map(|param| param.trim().strip_prefix("rate="))
            .find_map(|rate| rate.trim().parse::<u32>().ok())
            .unwrap_or(default_rate);
        (rate > 0).then(|| Self::mono(rate))
    }

    /// Samples covering `duration_ms` of audio.
    pub fn samples_for(&self, duration_ms: u32) -> usize {
        (u64::from(self.sample_rate) * u64::from(self.channels) * u64::from(duration_ms) / 1000)
            as usize
    }

    /// Playback time of `samples` samples.
    pub fn duration_of(&self, samples: usize) -> Duration {
        let per_second = u64::from(self.sample_rate) * u64::from(self.channels.max(1));
        if per_second == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(samples as u64 * 1_000_000 / per_second)
    }
}

/// Encode samples as little-endian PCM16 bytes.
pub fn encode_pcm16(samples: &[i16]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 2);
    for &sample in samples {
        buf.put_i16_le(sample);
    }
    buf.freeze()
}

/// Decode little-endian PCM16 bytes. A trailing odd byte is ignored.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect()
}

/// Convert a normalized float sample to PCM16.
pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * f32::from(i16::MAX)) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AudioConfig::default();
        assert_eq!(config.input_sample_rate, 16000);
        assert_eq!(config.output_sample_rate, 24000);
        assert_eq!(config.samples_per_chunk(), 1600);
    }

    #[test]
    fn test_pcm16_little_endian() {
        let bytes = encode_pcm16(&[1, -2, i16::MAX]);
        assert_eq!(bytes.as_ref(), &[0x01, 0x00, 0xFE, 0xFF, 0xFF, 0x7F]);
        assert_eq!(decode_pcm16(&bytes), vec![1, -2, i16::MAX]);
    }

    #[test]
    fn test_decode_ignores_trailing_byte() {
        assert_eq!(decode_pcm16(&[0x10, 0x00, 0x20]), vec![16]);
    }

    #[test]
    fn test_from_mime() {
        assert_eq!(
            PcmFormat::from_mime("audio/pcm;rate=24000", 16000),
            Some(PcmFormat::mono(24000))
        );
        assert_eq!(
            PcmFormat::from_mime("audio/pcm", 16000),
            Some(PcmFormat::mono(16000))
        );
        assert_eq!(PcmFormat::from_mime("audio/webm", 16000), None);
        assert_eq!(PcmFormat::from_mime("audio/pcm;rate=0", 16000), None);
    }

    #[test]
    fn test_duration_of() {
        let format = PcmFormat::mono(24000);
        assert_eq!(format.duration_of(2400), Duration::from_millis(100));
        assert_eq!(format.duration_of(0), Duration::ZERO);
    }

    #[test]
    fn test_f32_to_i16_clamps() {
        assert_eq!(f32_to_i16(2.0), i16::MAX);
        assert_eq!(f32_to_i16(0.0), 0);
        assert_eq!(f32_to_i16(-1.0), -i16::MAX);
    }
}
