//! File sink: one mono 16-bit WAV per buffer.

use std::fs;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{debug, info};

use super::{AudioSink, SinkError};
use crate::synth::AudioBuffer;

pub struct WavSink {
    output_dir: PathBuf,
    sample_rate: Option<u32>,
    seq: u64,
}

impl WavSink {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
            sample_rate: None,
            seq: 0,
        }
    }

    /// Files written since the last `configure`.
    pub fn files_written(&self) -> u64 {
        self.seq
    }

    fn next_path(&self) -> PathBuf {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis())
            .unwrap_or(0);
        self.output_dir.join(format!("{millis}_{}.wav", self.seq))
    }
}

impl AudioSink for WavSink {
    fn configure(&mut self, sample_rate: u32) -> Result<(), SinkError> {
        fs::create_dir_all(&self.output_dir)?;
        self.sample_rate = Some(sample_rate);
        self.seq = 0;
        info!("Writing audio to {}", self.output_dir.display());
        Ok(())
    }

    fn write(&mut self, buffer: &AudioBuffer) -> Result<(), SinkError> {
        let sample_rate = self.sample_rate.ok_or(SinkError::NotConfigured)?;
        if buffer.sample_rate() != sample_rate {
            return Err(SinkError::SampleRateMismatch {
                expected: sample_rate,
                got: buffer.sample_rate(),
            });
        }

        let path = self.next_path();
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut writer = hound::WavWriter::create(&path, spec)?;
        for &sample in buffer.samples() {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
        self.seq += 1;

        debug!("Saved {:.1}s to {}", buffer.duration_secs(), path.display());
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        if self.sample_rate.take().is_some() {
            info!("Wrote {} file(s) to {}", self.seq, self.output_dir.display());
        }
        Ok(())
    }
}
