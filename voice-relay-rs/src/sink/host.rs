//! Output device access.
//!
//! [`DeviceHost`] resolves device names and opens streams. Streams are
//! opened on the worker thread that owns them and never cross threads,
//! since cpal streams are not `Send` on every platform.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SizedSample};
use tracing::{debug, info, warn};

use super::SinkError;

const WAIT_SLICE: Duration = Duration::from_millis(20);
const DEFAULT_DEVICE: &str = "default";

/// A resolved output endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// Full device name; `None` is the host default output.
    pub device: Option<String>,
    /// Human-readable name for logs.
    pub label: String,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label)
    }
}

/// True if `pattern` selects the host default output.
pub fn is_default_pattern(pattern: Option<&str>) -> bool {
    match pattern {
        None => true,
        Some(p) => p.trim().is_empty() || p.trim().eq_ignore_ascii_case(DEFAULT_DEVICE),
    }
}

pub trait DeviceHost: Send + Sync + 'static {
    /// Resolve a name pattern (substring match) to an endpoint.
    fn resolve(&self, pattern: Option<&str>) -> Result<Endpoint, SinkError>;

    /// Open a mono stream for `sample_rate` PCM. Called on the worker thread.
    fn open(&self, endpoint: &Endpoint, sample_rate: u32) -> Result<Box<dyn DeviceStream>, SinkError>;
}

/// One open output stream, owned by exactly one worker.
pub trait DeviceStream {
    /// Play `pcm` and block until the device has consumed it or `abort` is
    /// raised.
    fn write(&mut self, pcm: &[i16], abort: &AtomicBool) -> Result<(), SinkError>;

    fn close(self: Box<Self>);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// cpal-backed host using the platform default audio API.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalHost;

impl CpalHost {
    fn find_device(&self, name: Option<&str>) -> Result<cpal::Device, SinkError> {
        let host = cpal::default_host();
        match name {
            None => host
                .default_output_device()
                .ok_or_else(|| SinkError::DeviceNotFound(DEFAULT_DEVICE.into())),
            Some(name) => host
                .output_devices()
                .map_err(|e| SinkError::Host(format!("Failed to enumerate output devices: {e}")))?
                .find(|d| d.name().map(|n| n == name).unwrap_or(false))
                .ok_or_else(|| SinkError::DeviceNotFound(name.to_string())),
        }
    }

    /// Names of every output device the host reports.
    pub fn device_names(&self) -> Result<Vec<String>, SinkError> {
        let host = cpal::default_host();
        let devices = host
            .output_devices()
            .map_err(|e| SinkError::Host(format!("Failed to enumerate output devices: {e}")))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }
}

impl DeviceHost for CpalHost {
    fn resolve(&self, pattern: Option<&str>) -> Result<Endpoint, SinkError> {
        if is_default_pattern(pattern) {
            let device = self.find_device(None)?;
            let name = device.name().unwrap_or_else(|_| "unknown".into());
            return Ok(Endpoint {
                device: None,
                label: format!("default ({name})"),
            });
        }

        let pattern = pattern.unwrap_or_default();
        let name = self
            .device_names()?
            .into_iter()
            .find(|n| n.contains(pattern))
            .ok_or_else(|| SinkError::DeviceNotFound(pattern.to_string()))?;
        Ok(Endpoint {
            label: name.clone(),
            device: Some(name),
        })
    }

    fn open(&self, endpoint: &Endpoint, sample_rate: u32) -> Result<Box<dyn DeviceStream>, SinkError> {
        let device = self.find_device(endpoint.device.as_deref())?;
        let stream = CpalStream::open(&device, endpoint.label.clone(), sample_rate)?;
        Ok(Box::new(stream))
    }
}

/// Samples waiting for the audio callback.
#[derive(Default)]
struct PlaybackQueue {
    samples: Mutex<VecDeque<f32>>,
    drained: Condvar,
    failure: Mutex<Option<String>>,
}

pub struct CpalStream {
    stream: cpal::Stream,
    queue: Arc<PlaybackQueue>,
    source_rate: u32,
    device_rate: u32,
    label: String,
}

impl CpalStream {
    fn open(device: &cpal::Device, label: String, sample_rate: u32) -> Result<Self, SinkError> {
        let default = device
            .default_output_config()
            .map_err(|e| SinkError::Stream(format!("Failed to query default output config: {e}")))?;
        let format = default.sample_format();
        let channels = default.channels();

        // Prefer the synthesizer's rate; otherwise resample to the device default.
        let supports_rate = device
            .supported_output_configs()
            .map(|mut ranges| {
                ranges.any(|r| {
                    r.channels() == channels
                        && r.sample_format() == format
                        && r.min_sample_rate().0 <= sample_rate
                        && sample_rate <= r.max_sample_rate().0
                })
            })
            .unwrap_or(false);
        let device_rate = if supports_rate {
            sample_rate
        } else {
            default.sample_rate().0
        };

        let config = cpal::StreamConfig {
            channels,
            sample_rate: cpal::SampleRate(device_rate),
            buffer_size: cpal::BufferSize::Default,
        };
        let queue = Arc::new(PlaybackQueue::default());

        let stream = match format {
            cpal::SampleFormat::F32 => build_stream::<f32>(device, &config, &queue, &label),
            cpal::SampleFormat::I16 => build_stream::<i16>(device, &config, &queue, &label),
            cpal::SampleFormat::U16 => build_stream::<u16>(device, &config, &queue, &label),
            other => {
                return Err(SinkError::Stream(format!(
                    "unsupported output sample format: {other:?}"
                )))
            }
        }
        .map_err(|e| SinkError::Stream(format!("Failed to build output stream: {e}")))?;

        stream
            .play()
            .map_err(|e| SinkError::Stream(format!("Failed to start output stream: {e}")))?;

        info!("{label}: opened at {device_rate} Hz, {channels} channel(s), {format:?}");
        if device_rate != sample_rate {
            debug!("{label}: resampling {sample_rate} Hz → {device_rate} Hz");
        }

        Ok(Self {
            stream,
            queue,
            source_rate: sample_rate,
            device_rate,
            label,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<PlaybackQueue>,
    label: &str,
) -> Result<cpal::Stream, cpal::BuildStreamError>
where
    T: SizedSample + FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let data_queue = Arc::clone(queue);
    let error_queue = Arc::clone(queue);
    let label = label.to_string();

    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| fill_frames(data, channels, &data_queue),
        move |err| {
            warn!("{label}: output stream error: {err}");
            *lock(&error_queue.failure) = Some(err.to_string());
        },
        None,
    )
}

/// Mono samples are duplicated across every device channel; underruns play
/// silence.
fn fill_frames<T>(out: &mut [T], channels: usize, queue: &PlaybackQueue)
where
    T: Sample + FromSample<f32>,
{
    let mut samples = lock(&queue.samples);
    for frame in out.chunks_mut(channels) {
        let value = T::from_sample(samples.pop_front().unwrap_or(0.0));
        frame.fill(value);
    }
    if samples.is_empty() {
        queue.drained.notify_all();
    }
}

impl DeviceStream for CpalStream {
    fn write(&mut self, pcm: &[i16], abort: &AtomicBool) -> Result<(), SinkError> {
        let samples: Vec<f32> = pcm.iter().map(|&s| f32::from(s) / 32768.0).collect();
        let samples = resample_linear(&samples, self.source_rate, self.device_rate);

        let mut queue = lock(&self.queue.samples);
        queue.extend(samples);
        loop {
            if let Some(err) = lock(&self.queue.failure).take() {
                queue.clear();
                return Err(SinkError::Stream(err));
            }
            if queue.is_empty() {
                return Ok(());
            }
            if abort.load(Ordering::Acquire) {
                debug!("{}: write aborted with {} samples pending", self.label, queue.len());
                queue.clear();
                return Ok(());
            }
            let (guard, _) = self
                .queue
                .drained
                .wait_timeout(queue, WAIT_SLICE)
                .unwrap_or_else(PoisonError::into_inner);
            queue = guard;
        }
    }

    fn close(self: Box<Self>) {
        if let Err(e) = self.stream.pause() {
            debug!("{}: pause on close failed: {e}", self.label);
        }
    }
}

/// Linear-interpolation resampler for mono audio.
pub fn resample_linear(input: &[f32], from: u32, to: u32) -> Vec<f32> {
    if from == to || from == 0 || to == 0 || input.is_empty() {
        return input.to_vec();
    }
    let out_len = ((input.len() as u64 * u64::from(to)) / u64::from(from)).max(1) as usize;
    let step = f64::from(from) / f64::from(to);
    let last = input.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = (pos - idx as f64) as f32;
            let a = input[idx];
            let b = input[(idx + 1).min(last)];
            a + (b - a) * frac
        })
        .collect()
}
