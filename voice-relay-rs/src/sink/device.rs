//! Multi-endpoint sink: the same audio on several output devices at once.
//!
//! Each endpoint gets a dedicated worker thread that opens and owns its
//! device stream. Workers share no state with the sink except:
//! - a bounded data channel per worker carrying [`WorkerMessage`]s
//! - one readiness channel shared by all workers
//! - a per-worker abort flag used to force-stop a blocked write
//!
//! Close signals travel on the data channel behind any queued buffers, so a
//! worker never plays a buffer after it has seen `Close`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use tracing::{debug, error, info, warn};

use super::host::{DeviceHost, Endpoint};
use super::{AudioSink, SinkError};
use crate::config::SinkConfig;
use crate::synth::AudioBuffer;

const JOIN_POLL: Duration = Duration::from_millis(10);

#[derive(Debug)]
enum WorkerMessage {
    Play(Vec<i16>),
    Close,
}

#[derive(Debug)]
enum WorkerReport {
    Ready(String),
    Failed { endpoint: String, reason: String },
}

struct WorkerHandle {
    label: String,
    data_tx: Sender<WorkerMessage>,
    abort: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// Workers of one configure/close cycle.
struct SinkSession {
    sample_rate: u32,
    workers: Vec<WorkerHandle>,
}

impl SinkSession {
    /// Ask every worker to close, force-stop stragglers after `grace`, and
    /// join them all.
    fn shutdown(self, grace: Duration) -> Result<(), SinkError> {
        let deadline = Instant::now() + grace;
        for worker in &self.workers {
            match worker.data_tx.send_deadline(WorkerMessage::Close, deadline) {
                Ok(()) => {}
                Err(SendTimeoutError::Timeout(_)) => {
                    warn!("{}: queue still full after {grace:?}, forcing", worker.label);
                    worker.abort.store(true, Ordering::Release);
                }
                // Already exited.
                Err(SendTimeoutError::Disconnected(_)) => {}
            }
        }

        while Instant::now() < deadline && self.workers.iter().any(|w| !w.join.is_finished()) {
            thread::sleep(JOIN_POLL);
        }

        let mut result = Ok(());
        for worker in self.workers {
            let WorkerHandle {
                label,
                data_tx,
                abort,
                join,
            } = worker;
            if !join.is_finished() {
                warn!("{label}: did not stop within {grace:?}, forcing");
                abort.store(true, Ordering::Release);
            }
            // A forced worker that never saw `Close` wakes on disconnect.
            drop(data_tx);
            if join.join().is_err() {
                error!("{label}: worker panicked");
                if result.is_ok() {
                    result = Err(SinkError::WorkerPanicked(label));
                }
            }
        }
        result
    }
}

pub struct DeviceSink {
    host: Arc<dyn DeviceHost>,
    devices: Vec<Option<String>>,
    channel_capacity: usize,
    ready_timeout: Duration,
    close_grace: Duration,
    session: Option<SinkSession>,
}

impl DeviceSink {
    pub fn new(host: Arc<dyn DeviceHost>, config: &SinkConfig) -> Self {
        Self {
            host,
            devices: config.devices.iter().map(|d| Some(d.clone())).collect(),
            channel_capacity: config.channel_capacity.max(1),
            ready_timeout: Duration::from_millis(config.ready_timeout_ms),
            close_grace: Duration::from_millis(config.close_grace_ms),
            session: None,
        }
    }

    /// Replace the device list; `None` is the host default output.
    pub fn with_devices(mut self, devices: Vec<Option<String>>) -> Self {
        self.devices = devices;
        self
    }

    pub fn is_configured(&self) -> bool {
        self.session.is_some()
    }

    fn spawn_worker(
        &self,
        index: usize,
        endpoint: Endpoint,
        sample_rate: u32,
        ready_tx: Sender<WorkerReport>,
    ) -> Result<WorkerHandle, SinkError> {
        let (data_tx, data_rx) = crossbeam_channel::bounded(self.channel_capacity);
        let abort = Arc::new(AtomicBool::new(false));
        let label = endpoint.label.clone();

        let host = Arc::clone(&self.host);
        let worker_abort = Arc::clone(&abort);
        let join = thread::Builder::new()
            .name(format!("sink-worker-{index}"))
            .spawn(move || run_worker(host, endpoint, sample_rate, data_rx, ready_tx, worker_abort))?;

        Ok(WorkerHandle {
            label,
            data_tx,
            abort,
            join,
        })
    }

    fn await_ready(&self, ready_rx: &Receiver<WorkerReport>, expected: usize) -> Result<(), SinkError> {
        let deadline = Instant::now() + self.ready_timeout;
        let mut ready = 0;
        while ready < expected {
            match ready_rx.recv_deadline(deadline) {
                Ok(WorkerReport::Ready(label)) => {
                    ready += 1;
                    debug!("{label}: ready ({ready}/{expected})");
                }
                Ok(WorkerReport::Failed { endpoint, reason }) => {
                    return Err(SinkError::WorkerFailed { endpoint, reason });
                }
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SinkError::ReadyTimeout {
                        pending: expected - ready,
                    });
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SinkError::Protocol(
                        "worker exited before reporting ready".into(),
                    ));
                }
            }
        }
        Ok(())
    }
}

impl AudioSink for DeviceSink {
    fn configure(&mut self, sample_rate: u32) -> Result<(), SinkError> {
        if self.session.is_some() {
            return Err(SinkError::Protocol("sink is already configured".into()));
        }
        if self.devices.is_empty() {
            return Err(SinkError::Protocol("no output devices configured".into()));
        }

        let endpoints = self
            .devices
            .iter()
            .map(|d| self.host.resolve(d.as_deref()))
            .collect::<Result<Vec<_>, _>>()?;

        let (ready_tx, ready_rx) = crossbeam_channel::unbounded();
        let mut session = SinkSession {
            sample_rate,
            workers: Vec::with_capacity(endpoints.len()),
        };
        for (index, endpoint) in endpoints.into_iter().enumerate() {
            match self.spawn_worker(index, endpoint, sample_rate, ready_tx.clone()) {
                Ok(worker) => session.workers.push(worker),
                Err(e) => {
                    let _ = session.shutdown(self.close_grace);
                    return Err(e);
                }
            }
        }
        drop(ready_tx);

        let expected = session.workers.len();
        if let Err(e) = self.await_ready(&ready_rx, expected) {
            let _ = session.shutdown(self.close_grace);
            return Err(e);
        }

        info!("All {expected} output streams ready at {sample_rate} Hz");
        self.session = Some(session);
        Ok(())
    }

    fn write(&mut self, buffer: &AudioBuffer) -> Result<(), SinkError> {
        let session = self.session.as_ref().ok_or(SinkError::NotConfigured)?;
        if buffer.sample_rate() != session.sample_rate {
            return Err(SinkError::SampleRateMismatch {
                expected: session.sample_rate,
                got: buffer.sample_rate(),
            });
        }

        for worker in &session.workers {
            worker
                .data_tx
                .send(WorkerMessage::Play(buffer.samples().to_vec()))
                .map_err(|_| SinkError::WorkerGone(worker.label.clone()))?;
        }
        debug!(
            "Queued {:.1}s of audio to {} output(s)",
            buffer.duration_secs(),
            session.workers.len()
        );
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        info!("writer closing...");
        let result = session.shutdown(self.close_grace);
        info!("writer closed");
        result
    }
}

impl Drop for DeviceSink {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            let _ = session.shutdown(self.close_grace);
        }
    }
}

fn run_worker(
    host: Arc<dyn DeviceHost>,
    endpoint: Endpoint,
    sample_rate: u32,
    data_rx: Receiver<WorkerMessage>,
    ready_tx: Sender<WorkerReport>,
    abort: Arc<AtomicBool>,
) {
    let label = endpoint.label.clone();
    debug!("{label}: configure...");

    let mut stream = match host.open(&endpoint, sample_rate) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = ready_tx.send(WorkerReport::Failed {
                endpoint: label,
                reason: e.to_string(),
            });
            return;
        }
    };

    if ready_tx.send(WorkerReport::Ready(label.clone())).is_err() {
        stream.close();
        return;
    }
    drop(ready_tx);
    info!("{label}: ready");

    loop {
        match data_rx.recv() {
            Ok(WorkerMessage::Play(pcm)) => {
                if abort.load(Ordering::Acquire) {
                    break;
                }
                if let Err(e) = stream.write(&pcm, &abort) {
                    error!("{label}: write failed: {e}");
                    break;
                }
            }
            Ok(WorkerMessage::Close) | Err(_) => break,
        }
    }

    stream.close();
    info!("{label}: stopped");
}
