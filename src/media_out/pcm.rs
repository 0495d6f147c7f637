//! PCM16 decoding and frame slicing.

use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// Fixed-length batch of normalized samples scheduled as one playback unit.
/// Immutable once created.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    samples: Vec<f32>,
    sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self { samples, sample_rate }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Duration in seconds (`len / sample_rate`).
    pub fn duration(&self) -> f64 {
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

/// Frames produced from one inbound chunk; most chunks yield one or two.
pub type Frames = SmallVec<[Arc<AudioFrame>; 4]>;

/// Decode little-endian signed 16-bit samples into `[-1.0, 1.0)`.
///
/// A trailing odd byte cannot form a sample and is skipped.
pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    let chunks = bytes.chunks_exact(2);
    if !chunks.remainder().is_empty() {
        debug!("Skipping {} trailing byte(s) of PCM16 chunk", chunks.remainder().len());
    }
    chunks
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / 32768.0)
        .collect()
}

/// Encode samples back to PCM16 little-endian, clamping out-of-range values.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|s| to_i16(*s).to_le_bytes())
        .collect()
}

pub fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

/// Slice samples into frames of exactly `frame_samples`; a non-empty
/// remainder becomes one final short frame and is not padded.
pub fn split_frames(samples: &[f32], frame_samples: usize, sample_rate: u32) -> Frames {
    samples
        .chunks(frame_samples.max(1))
        .map(|chunk| Arc::new(AudioFrame::new(chunk.to_vec(), sample_rate)))
        .collect()
}
