//! Pipeline orchestration with a forward-only state machine.
//!
//! CREATED → CONFIGURED → RUNNING → CLOSING → CLOSED

use std::fmt;
use std::panic::{self, AssertUnwindSafe};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::reader::TextSource;
use crate::sink::{AudioSink, SinkError};
use crate::synth::{ProsodyTagError, SynthesisError, Synthesizer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Created,
    Configured,
    Running,
    Closing,
    Closed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "CREATED"),
            Self::Configured => write!(f, "CONFIGURED"),
            Self::Running => write!(f, "RUNNING"),
            Self::Closing => write!(f, "CLOSING"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("pipeline already started (state {0})")]
    AlreadyStarted(PipelineState),

    #[error("audio sink failed: {0}")]
    Sink(#[from] SinkError),

    #[error("synthesizer setup failed: {0}")]
    SynthesizerSetup(SynthesisError),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub items_read: usize,
    pub items_played: usize,
    pub items_failed: usize,
    /// The run stopped because the cancellation token fired.
    pub interrupted: bool,
}

/// Short diagnostic for a per-item synthesis failure.
fn diagnostic(err: &SynthesisError) -> &'static str {
    match err {
        SynthesisError::MalformedMarkup(_) => "Wrong ssml syntax",
        SynthesisError::ProsodyTag(ProsodyTagError::Invalid(_)) => "invalid prosody tag",
        SynthesisError::ProsodyTag(ProsodyTagError::Empty) => "empty <prosody> tag",
        SynthesisError::Engine(_) | SynthesisError::Unknown(_) => "Unknown error",
    }
}

pub struct Pipeline {
    reader: Box<dyn TextSource>,
    sink: Box<dyn AudioSink>,
    synth: Box<dyn Synthesizer>,
    cancel: CancellationToken,
    state: PipelineState,
}

impl Pipeline {
    pub fn new(
        reader: Box<dyn TextSource>,
        sink: Box<dyn AudioSink>,
        synth: Box<dyn Synthesizer>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            reader,
            sink,
            synth,
            cancel,
            state: PipelineState::Created,
        }
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Configure everything, play items until the source ends or the token
    /// fires, then close the reader and the sink.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        if self.state != PipelineState::Created {
            return Err(PipelineError::AlreadyStarted(self.state));
        }

        // A panicking reader, synthesizer or sink still gets the close
        // sequence before the panic continues.
        let outcome = match panic::catch_unwind(AssertUnwindSafe(|| self.configure_and_process())) {
            Ok(outcome) => outcome,
            Err(payload) => {
                error!("Pipeline panicked, closing reader and sink");
                if let Err(e) = self.close_all() {
                    error!("Sink close failed after panic: {e}");
                }
                panic::resume_unwind(payload);
            }
        };

        self.shutdown(outcome)
    }

    fn configure_and_process(&mut self) -> Result<RunSummary, PipelineError> {
        match self.configure() {
            Ok(()) => {
                self.transition(PipelineState::Configured);
                self.process()
            }
            Err(e) => {
                error!("Configuration failed: {e}");
                Err(e)
            }
        }
    }

    fn transition(&mut self, next: PipelineState) {
        info!("State: {} → {}", self.state, next);
        self.state = next;
    }

    fn configure(&mut self) -> Result<(), PipelineError> {
        self.reader.configure();
        self.sink.configure(self.synth.sample_rate())?;
        self.synth
            .configure()
            .map_err(PipelineError::SynthesizerSetup)
    }

    fn process(&mut self) -> Result<RunSummary, PipelineError> {
        self.transition(PipelineState::Running);
        let mut summary = RunSummary::default();

        for item in self.reader.read() {
            if self.cancel.is_cancelled() {
                break;
            }
            summary.items_read += 1;

            let buffer = match self.synth.synthesize(&item.markup, item.speaker.as_ref()) {
                Ok(buffer) => buffer,
                Err(e) => {
                    warn!("{}: {e}", diagnostic(&e));
                    debug!("Skipped markup: {}", item.markup);
                    summary.items_failed += 1;
                    continue;
                }
            };

            if self.cancel.is_cancelled() {
                debug!("Abandoning synthesized item after cancellation");
                break;
            }
            if buffer.is_empty() {
                warn!("Synthesizer returned no audio, skipping");
                summary.items_failed += 1;
                continue;
            }

            self.sink.write(&buffer)?;
            summary.items_played += 1;
        }

        summary.interrupted = self.cancel.is_cancelled();
        if summary.interrupted {
            info!("Interrupted");
        }
        Ok(summary)
    }

    fn close_all(&mut self) -> Result<(), SinkError> {
        self.transition(PipelineState::Closing);
        self.reader.close();
        let closed = self.sink.close();
        self.transition(PipelineState::Closed);
        closed
    }

    fn shutdown(
        &mut self,
        outcome: Result<RunSummary, PipelineError>,
    ) -> Result<RunSummary, PipelineError> {
        match (outcome, self.close_all()) {
            (Ok(summary), Ok(())) => Ok(summary),
            (Ok(_), Err(e)) => Err(e.into()),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(close_err)) => {
                error!("Sink close failed after an earlier error: {close_err}");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::{SpeakerId, TextItem};
    use crate::synth::AudioBuffer;
    use std::sync::{Arc, Mutex};

    type Log = Arc<Mutex<Vec<String>>>;

    fn push(log: &Log, event: impl Into<String>) {
        log.lock().unwrap().push(event.into());
    }

    fn events(log: &Log) -> Vec<String> {
        log.lock().unwrap().clone()
    }

    struct VecSource {
        items: Vec<TextItem>,
        log: Log,
    }

    impl TextSource for VecSource {
        fn configure(&mut self) {
            push(&self.log, "reader.configure");
        }

        fn read(&mut self) -> Box<dyn Iterator<Item = TextItem> + '_> {
            Box::new(self.items.drain(..))
        }

        fn close(&mut self) {
            push(&self.log, "reader.close");
        }
    }

    #[derive(Default)]
    struct StubSynth {
        log: Log,
        calls: usize,
        fail_on: Vec<usize>,
        fail_configure: bool,
        cancel_on: Option<(usize, CancellationToken)>,
        panic_on: Option<usize>,
    }

    impl Synthesizer for StubSynth {
        fn sample_rate(&self) -> u32 {
            24000
        }

        fn configure(&mut self) -> Result<(), SynthesisError> {
            push(&self.log, "synth.configure");
            if self.fail_configure {
                return Err(SynthesisError::Engine("no model".into()));
            }
            Ok(())
        }

        fn synthesize(
            &mut self,
            markup: &str,
            _speaker: Option<&SpeakerId>,
        ) -> Result<AudioBuffer, SynthesisError> {
            let index = self.calls;
            self.calls += 1;
            if let Some((at, token)) = &self.cancel_on {
                if *at == index {
                    token.cancel();
                }
            }
            if self.panic_on == Some(index) {
                panic!("engine crashed on item {index}");
            }
            if self.fail_on.contains(&index) {
                return Err(SynthesisError::MalformedMarkup(markup.to_string()));
            }
            Ok(AudioBuffer::new(24000, vec![index as i16; 8]))
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        log: Log,
        written: Arc<Mutex<Vec<i16>>>,
        fail_write_on: Option<usize>,
        fail_configure: bool,
    }

    impl AudioSink for RecordingSink {
        fn configure(&mut self, sample_rate: u32) -> Result<(), SinkError> {
            push(&self.log, format!("sink.configure({sample_rate})"));
            if self.fail_configure {
                return Err(SinkError::DeviceNotFound("CABLE Input".into()));
            }
            Ok(())
        }

        fn write(&mut self, buffer: &AudioBuffer) -> Result<(), SinkError> {
            let mut written = self.written.lock().unwrap();
            if self.fail_write_on == Some(written.len()) {
                return Err(SinkError::WorkerGone("monitor".into()));
            }
            written.push(buffer.samples()[0]);
            Ok(())
        }

        fn close(&mut self) -> Result<(), SinkError> {
            push(&self.log, "sink.close");
            Ok(())
        }
    }

    fn items(n: usize) -> Vec<TextItem> {
        (0..n)
            .map(|i| TextItem {
                markup: format!("<speak>item {i}</speak>"),
                speaker: None,
            })
            .collect()
    }

    fn pipeline(
        n: usize,
        synth: StubSynth,
        sink: RecordingSink,
        log: &Log,
        cancel: CancellationToken,
    ) -> Pipeline {
        let source = VecSource {
            items: items(n),
            log: Arc::clone(log),
        };
        Pipeline::new(Box::new(source), Box::new(sink), Box::new(synth), cancel)
    }

    #[test]
    fn one_failed_item_does_not_stop_the_run() {
        let log = Log::default();
        let written = Arc::new(Mutex::new(Vec::new()));
        let synth = StubSynth {
            log: Arc::clone(&log),
            fail_on: vec![2],
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            written: Arc::clone(&written),
            ..RecordingSink::default()
        };
        let mut p = pipeline(5, synth, sink, &log, CancellationToken::new());

        let summary = p.run().unwrap();
        assert_eq!(
            summary,
            RunSummary {
                items_read: 5,
                items_played: 4,
                items_failed: 1,
                interrupted: false,
            }
        );
        assert_eq!(*written.lock().unwrap(), vec![0, 1, 3, 4]);
        assert_eq!(p.state(), PipelineState::Closed);
    }

    #[test]
    fn lifecycle_order_is_reader_sink_synth_then_close() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            ..RecordingSink::default()
        };
        let mut p = pipeline(1, synth, sink, &log, CancellationToken::new());
        p.run().unwrap();

        assert_eq!(
            events(&log),
            vec![
                "reader.configure",
                "sink.configure(24000)",
                "synth.configure",
                "reader.close",
                "sink.close",
            ]
        );
    }

    #[test]
    fn fatal_write_error_still_closes_everything() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            fail_write_on: Some(1),
            ..RecordingSink::default()
        };
        let mut p = pipeline(3, synth, sink, &log, CancellationToken::new());

        assert!(matches!(p.run(), Err(PipelineError::Sink(SinkError::WorkerGone(_)))));
        let events = events(&log);
        assert!(events.ends_with(&["reader.close".to_string(), "sink.close".to_string()]));
        assert_eq!(p.state(), PipelineState::Closed);
    }

    #[test]
    fn sink_configure_failure_skips_synth_and_closes() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            fail_configure: true,
            ..RecordingSink::default()
        };
        let mut p = pipeline(2, synth, sink, &log, CancellationToken::new());

        assert!(matches!(p.run(), Err(PipelineError::Sink(SinkError::DeviceNotFound(_)))));
        assert_eq!(
            events(&log),
            vec![
                "reader.configure",
                "sink.configure(24000)",
                "reader.close",
                "sink.close",
            ]
        );
    }

    #[test]
    fn synth_configure_failure_is_fatal() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            fail_configure: true,
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            ..RecordingSink::default()
        };
        let mut p = pipeline(2, synth, sink, &log, CancellationToken::new());
        assert!(matches!(p.run(), Err(PipelineError::SynthesizerSetup(_))));
        assert!(events(&log).contains(&"sink.close".to_string()));
    }

    #[test]
    fn cancellation_abandons_in_flight_item() {
        let log = Log::default();
        let cancel = CancellationToken::new();
        let written = Arc::new(Mutex::new(Vec::new()));
        let synth = StubSynth {
            log: Arc::clone(&log),
            cancel_on: Some((1, cancel.clone())),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            written: Arc::clone(&written),
            ..RecordingSink::default()
        };
        let mut p = pipeline(4, synth, sink, &log, cancel);

        let summary = p.run().unwrap();
        assert!(summary.interrupted);
        assert_eq!(summary.items_played, 1);
        assert_eq!(*written.lock().unwrap(), vec![0]);
        assert!(events(&log).ends_with(&["reader.close".to_string(), "sink.close".to_string()]));
    }

    #[test]
    fn panicking_synth_still_closes_reader_then_sink() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            panic_on: Some(1),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            ..RecordingSink::default()
        };
        let mut p = pipeline(3, synth, sink, &log, CancellationToken::new());

        let result = panic::catch_unwind(AssertUnwindSafe(|| p.run()));
        assert!(result.is_err());
        assert_eq!(
            events(&log),
            vec![
                "reader.configure",
                "sink.configure(24000)",
                "synth.configure",
                "reader.close",
                "sink.close",
            ]
        );
        assert_eq!(p.state(), PipelineState::Closed);
    }

    #[test]
    fn run_twice_is_rejected() {
        let log = Log::default();
        let synth = StubSynth {
            log: Arc::clone(&log),
            ..StubSynth::default()
        };
        let sink = RecordingSink {
            log: Arc::clone(&log),
            ..RecordingSink::default()
        };
        let mut p = pipeline(0, synth, sink, &log, CancellationToken::new());
        p.run().unwrap();
        assert!(matches!(
            p.run(),
            Err(PipelineError::AlreadyStarted(PipelineState::Closed))
        ));
    }

    #[test]
    fn diagnostics_per_error_kind() {
        assert_eq!(
            diagnostic(&SynthesisError::MalformedMarkup("x".into())),
            "Wrong ssml syntax"
        );
        assert_eq!(
            diagnostic(&ProsodyTagError::Invalid("rate".into()).into()),
            "invalid prosody tag"
        );
        assert_eq!(
            diagnostic(&ProsodyTagError::Empty.into()),
            "empty <prosody> tag"
        );
        assert_eq!(diagnostic(&SynthesisError::Unknown("?".into())), "Unknown error");
    }
}
