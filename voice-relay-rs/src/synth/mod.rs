//! Speech synthesis boundary.
//!
//! The pipeline only sees the [`Synthesizer`] trait: one slow `configure`,
//! then `synthesize(markup, speaker)` per item. Failures are typed so the
//! pipeline can report them per item and move on.

pub mod kokoro;
pub mod markup;

use thiserror::Error;

use crate::reader::SpeakerId;

pub use kokoro::KokoroSynthesizer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProsodyTagError {
    #[error("invalid <prosody> tag: {0}")]
    Invalid(String),

    #[error("empty <prosody> tag")]
    Empty,
}

#[derive(Debug, Error)]
pub enum SynthesisError {
    #[error("malformed markup: {0}")]
    MalformedMarkup(String),

    #[error(transparent)]
    ProsodyTag(#[from] ProsodyTagError),

    #[error("synthesis engine error: {0}")]
    Engine(String),

    #[error("{0}")]
    Unknown(String),
}

/// Mono 16-bit PCM produced for one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioBuffer {
    sample_rate: u32,
    samples: Vec<i16>,
}

impl AudioBuffer {
    pub fn new(sample_rate: u32, samples: Vec<i16>) -> Self {
        Self {
            sample_rate,
            samples,
        }
    }

    /// Convert model output in [-1, 1] to PCM, clamping overshoot.
    pub fn from_f32(sample_rate: u32, samples: &[f32]) -> Self {
        let pcm = samples
            .iter()
            .map(|&s| (s * 32767.0).clamp(-32768.0, 32767.0) as i16)
            .collect();
        Self::new(sample_rate, pcm)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.samples.len() as f64 / self.sample_rate as f64
    }
}

pub trait Synthesizer: Send {
    /// Rate of every buffer this synthesizer produces.
    fn sample_rate(&self) -> u32;

    /// One-time setup: model loading, warm-up.
    fn configure(&mut self) -> Result<(), SynthesisError>;

    fn synthesize(
        &mut self,
        markup: &str,
        speaker: Option<&SpeakerId>,
    ) -> Result<AudioBuffer, SynthesisError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_f32_scales_and_clamps() {
        let buf = AudioBuffer::from_f32(24000, &[0.0, 1.0, -1.0, 2.0, -2.0]);
        assert_eq!(buf.samples(), &[0, 32767, -32767, 32767, -32768]);
    }

    #[test]
    fn duration_from_sample_count() {
        let buf = AudioBuffer::new(24000, vec![0; 12000]);
        assert!((buf.duration_secs() - 0.5).abs() < f64::EPSILON);
        assert_eq!(AudioBuffer::new(0, vec![1]).duration_secs(), 0.0);
    }

    #[test]
    fn prosody_errors_render_distinct_messages() {
        let invalid = SynthesisError::from(ProsodyTagError::Invalid("no attributes".into()));
        let empty = SynthesisError::from(ProsodyTagError::Empty);
        assert_eq!(invalid.to_string(), "invalid <prosody> tag: no attributes");
        assert_eq!(empty.to_string(), "empty <prosody> tag");
    }
}
