//! Configuration management for voice-relay-rs.
//!
//! Loads config from YAML files in standard locations. Every section falls
//! back to its defaults, so a partial file is fine.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: serde_yml::Error,
    },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Speaker used until a `speaker <name>` command switches it.
    pub default_speaker: String,
    /// Speakers accepted by `speaker <name>`.
    pub speakers: Vec<String>,
    /// Initial prosody template for the queue reader (`{}` marks the text).
    pub prosody_template: String,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            default_speaker: "af_heart".into(),
            speakers: vec![
                "af_heart".into(),
                "af_bella".into(),
                "af_nicole".into(),
                "am_adam".into(),
                "am_michael".into(),
                "bf_emma".into(),
                "bm_george".into(),
            ],
            prosody_template: String::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Output devices, matched by substring. `default` (or an empty
    /// string) is the host's default output.
    pub devices: Vec<String>,
    /// Buffers queued per worker before `write` blocks.
    pub channel_capacity: usize,
    /// How long `configure` waits for every worker to report ready.
    pub ready_timeout_ms: u64,
    /// How long `close` waits before force-stopping workers.
    pub close_grace_ms: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            devices: vec!["default".into(), "CABLE Input".into()],
            channel_capacity: 16,
            ready_timeout_ms: 5000,
            close_grace_ms: 2000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WavConfig {
    pub output_dir: PathBuf,
}

impl Default for WavConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("./relay_results"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    pub model_path: String,
    pub voices_path: String,
    pub tokenizer_path: String,
    pub speed: f32,
    pub threads: usize,
    pub warmup: bool,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            model_path: String::new(),
            voices_path: String::new(),
            tokenizer_path: String::new(),
            speed: 1.0,
            threads: 4,
            warmup: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub reader: ReaderConfig,
    pub sink: SinkConfig,
    pub wav: WavConfig,
    pub tts: TtsConfig,
}

impl Config {
    /// Load configuration from YAML file.
    ///
    /// Searches standard locations if no path is provided:
    /// 1. ./config.yaml
    /// 2. ~/.config/voice-relay/config.yaml
    /// 3. /etc/voice-relay/config.yaml
    pub fn load(path: Option<&Path>) -> Self {
        let resolved = path.map(PathBuf::from).or_else(|| {
            let candidates = [
                std::env::current_dir().ok().map(|d| d.join("config.yaml")),
                dirs::home_dir().map(|h| h.join(".config/voice-relay/config.yaml")),
                Some(PathBuf::from("/etc/voice-relay/config.yaml")),
            ];
            candidates.into_iter().flatten().find(|p| p.exists())
        });

        let Some(config_path) = resolved else {
            info!("No config file found, using defaults");
            return Self::default();
        };

        match Self::from_file(&config_path) {
            Ok(config) => {
                info!("Loaded config from {}", config_path.display());
                config
            }
            Err(e) => {
                tracing::warn!("{e}, using defaults");
                Self::default()
            }
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_yml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yml::Error> {
        serde_yml::from_str(contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = Config::from_yaml("sink:\n  devices: [\"Headphones\"]\n").unwrap();
        assert_eq!(config.sink.devices, vec!["Headphones".to_string()]);
        assert_eq!(config.sink.channel_capacity, 16);
        assert_eq!(config.reader.default_speaker, "af_heart");
        assert!(config.tts.warmup);
    }

    #[test]
    fn default_sink_targets_two_endpoints() {
        let config = Config::default();
        assert_eq!(config.sink.devices.len(), 2);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let config = Config::load(Some(Path::new("/nonexistent/voice-relay.yaml")));
        assert_eq!(config.sink.close_grace_ms, 2000);
    }

    #[test]
    fn from_file_reports_parse_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "sink: [not, a, map]\n").unwrap();
        assert!(matches!(Config::from_file(&path), Err(ConfigError::Parse { .. })));

        std::fs::write(&path, "wav:\n  output_dir: /tmp/relay\n").unwrap();
        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.wav.output_dir, PathBuf::from("/tmp/relay"));
    }
}
