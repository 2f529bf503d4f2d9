//! voice-relay-rs: speak typed text on several audio outputs at once.

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use voice_relay::config::Config;
use voice_relay::pipeline::Pipeline;
use voice_relay::reader::{
    CommandReader, ProsodyPreprocessor, QueueHandle, QueueReader, SpeakerSet, StdinLines,
    TextSource,
};
use voice_relay::sink::{AudioSink, CpalHost, DeviceSink, WavSink};
use voice_relay::synth::KokoroSynthesizer;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum ReaderKind {
    /// Interactive console with speaker and prosody commands
    Console,
    /// Plain text queue fed from stdin
    Queue,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum WriterKind {
    /// Play on audio output devices
    Devices,
    /// Write one WAV file per utterance
    Wav,
}

#[derive(Parser, Debug)]
#[command(name = "voice-relay-rs", about = "Text-to-speech relay to multiple audio outputs")]
struct Args {
    /// Path to config.yaml
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Input source
    #[arg(long, value_enum, default_value_t = ReaderKind::Console)]
    reader: ReaderKind,

    /// Output target
    #[arg(long, value_enum, default_value_t = WriterKind::Devices)]
    writer: WriterKind,

    /// Output device name (substring match); repeat for several devices
    #[arg(short, long = "device")]
    devices: Vec<String>,

    /// Directory for --writer wav
    #[arg(long)]
    wav_dir: Option<PathBuf>,

    /// Enable verbose (debug) logging
    #[arg(short, long)]
    verbose: bool,
}

/// Forward stdin lines into the queue until `exit`/`stop` or end of input.
/// Lines starting with `template ` replace the prosody template.
fn feed_queue(lines: StdinLines, handle: QueueHandle) {
    for line in lines {
        let line = line.trim();
        if line.starts_with("exit") || line.starts_with("stop") {
            break;
        }
        let delivered = match line.strip_prefix("template ") {
            Some(template) => handle.set_prosody_template(template.trim()),
            None => handle.enqueue(line),
        };
        if !delivered {
            break;
        }
    }
}

fn build_reader(args: &Args, config: &Config, cancel: &CancellationToken) -> Box<dyn TextSource> {
    let speakers = SpeakerSet::new(config.reader.speakers.iter().cloned());
    let default_speaker = speakers.resolve(&config.reader.default_speaker);
    if default_speaker.is_none() {
        warn!(
            "Default speaker '{}' is not in the speaker list, using the synthesizer default",
            config.reader.default_speaker
        );
    }

    match args.reader {
        ReaderKind::Console => {
            let lines = StdinLines::spawn(cancel.clone());
            Box::new(CommandReader::new(
                Box::new(lines),
                speakers,
                default_speaker,
                vec![Box::new(ProsodyPreprocessor::new())],
            ))
        }
        ReaderKind::Queue => {
            let (reader, handle) = QueueReader::new(default_speaker, cancel.clone());
            let reader = reader.with_template(&config.reader.prosody_template);
            let lines = StdinLines::spawn(cancel.clone());
            std::thread::spawn(move || feed_queue(lines, handle));
            Box::new(reader)
        }
    }
}

fn build_sink(args: &Args, config: &Config) -> Box<dyn AudioSink> {
    match args.writer {
        WriterKind::Devices => {
            let mut sink = DeviceSink::new(Arc::new(CpalHost), &config.sink);
            if !args.devices.is_empty() {
                sink = sink.with_devices(args.devices.iter().cloned().map(Some).collect());
            }
            Box::new(sink)
        }
        WriterKind::Wav => {
            let dir = args
                .wav_dir
                .clone()
                .unwrap_or_else(|| config.wav.output_dir.clone());
            Box::new(WavSink::new(dir))
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize logging (suppress noisy ort internals)
    let filter = if args.verbose {
        EnvFilter::new("debug,ort=info")
    } else {
        EnvFilter::new("info,ort=warn")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("voice-relay-rs starting");

    let config = Config::load(args.config.as_deref());
    info!("Output devices: {:?}", config.sink.devices);

    let cancel = CancellationToken::new();
    let reader = build_reader(&args, &config, &cancel);
    let sink = build_sink(&args, &config);
    let synth = KokoroSynthesizer::new(&config.tts, &config.reader.default_speaker);

    // Ctrl-C stops the pipeline between items
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Ctrl-C received, stopping");
                cancel.cancel();
            }
        }
    });

    let mut pipeline = Pipeline::new(reader, sink, Box::new(synth), cancel);
    let summary = tokio::task::spawn_blocking(move || pipeline.run()).await??;

    info!(
        "Done: {} read, {} played, {} failed{}",
        summary.items_read,
        summary.items_played,
        summary.items_failed,
        if summary.interrupted { " (interrupted)" } else { "" }
    );

    Ok(())
}
