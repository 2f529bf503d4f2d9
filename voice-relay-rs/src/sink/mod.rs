//! Audio sinks: where synthesized buffers end up.

pub mod device;
pub mod host;
pub mod wav;

use thiserror::Error;

use crate::synth::AudioBuffer;

pub use device::DeviceSink;
pub use host::{CpalHost, DeviceHost, DeviceStream, Endpoint};
pub use wav::WavSink;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audio device not found: {0}")]
    DeviceNotFound(String),

    #[error("audio host error: {0}")]
    Host(String),

    #[error("sink used before configure()")]
    NotConfigured,

    #[error("sink protocol error: {0}")]
    Protocol(String),

    #[error("worker for '{endpoint}' failed to start: {reason}")]
    WorkerFailed { endpoint: String, reason: String },

    #[error("timed out waiting for {pending} output worker(s) to become ready")]
    ReadyTimeout { pending: usize },

    #[error("output worker for '{0}' is gone")]
    WorkerGone(String),

    #[error("output worker for '{0}' panicked")]
    WorkerPanicked(String),

    #[error("buffer is {got} Hz but the sink was configured for {expected} Hz")]
    SampleRateMismatch { expected: u32, got: u32 },

    #[error("output stream error: {0}")]
    Stream(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

pub trait AudioSink: Send {
    /// Open outputs for buffers at `sample_rate`.
    fn configure(&mut self, sample_rate: u32) -> Result<(), SinkError>;

    /// Hand a buffer to the outputs. May return before playback finishes.
    fn write(&mut self, buffer: &AudioBuffer) -> Result<(), SinkError>;

    /// Release outputs. Safe to call without a prior `configure`.
    fn close(&mut self) -> Result<(), SinkError>;
}
