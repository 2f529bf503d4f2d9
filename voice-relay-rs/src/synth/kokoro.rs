//! Kokoro TTS engine: markup → segments → phonemes → ONNX inference → PCM.
//!
//! Pipeline:
//! 1. Markup → speech segments and pauses (see `markup`)
//! 2. Segment text → sentences (split on .!?)
//! 3. Sentence → phonemes (misaki-rs G2P)
//! 4. Phonemes → token IDs (tokenizer.json vocabulary)
//! 5. Token IDs + voice style + speed → ONNX inference → f32 audio (24kHz)
//!
//! Kokoro has a speed input but no pitch control, so pitch levels are
//! accepted and ignored.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use ndarray::{Array2, Array3};
use ndarray_npy::NpzReader;
use ort::value::Tensor;
use tracing::{debug, info};

use super::markup::{self, Prosody, Segment};
use super::{AudioBuffer, SynthesisError, Synthesizer};
use crate::config::TtsConfig;
use crate::reader::SpeakerId;

pub const SAMPLE_RATE: u32 = 24000;
const MAX_TOKENS: usize = 510; // Voice style array first dimension

/// Loaded voice style data: shape (510, 1, 256) f32.
struct VoiceData {
    /// Style vectors indexed by token count. shape: (510, 256)
    styles: Array2<f32>,
}

/// Native Kokoro synthesizer.
pub struct KokoroSynthesizer {
    session: Option<ort::session::Session>,

    // Phonemizer (misaki-rs G2P)
    phonemizer: Option<misaki_rs::G2P>,

    // Tokenizer vocabulary: char → token ID
    vocab: HashMap<char, i64>,

    // Voices: name → style data
    voices: HashMap<String, VoiceData>,

    default_voice: String,
    speed: f32,
    threads: usize,
    warmup: bool,

    // Paths
    model_path: PathBuf,
    voices_path: PathBuf,
    tokenizer_path: PathBuf,
}

fn path_or(configured: &str, base_dir: &Path, fallback: &str) -> PathBuf {
    if configured.is_empty() {
        base_dir.join(fallback)
    } else {
        PathBuf::from(configured)
    }
}

/// Speed multiplier for a prosody rate level.
pub fn rate_multiplier(rate: Option<&str>) -> f32 {
    match rate {
        Some("x-slow") => 0.5,
        Some("slow") => 0.75,
        Some("fast") => 1.25,
        Some("x-fast") => 1.5,
        _ => 1.0,
    }
}

impl KokoroSynthesizer {
    pub fn new(config: &TtsConfig, default_voice: &str) -> Self {
        let base_dir = std::env::current_dir().unwrap_or_default();

        Self {
            session: None,
            phonemizer: None,
            vocab: HashMap::new(),
            voices: HashMap::new(),
            default_voice: default_voice.to_string(),
            speed: config.speed,
            threads: config.threads.max(1),
            warmup: config.warmup,
            model_path: path_or(&config.model_path, &base_dir, "kokoro-v1.0.onnx"),
            voices_path: path_or(&config.voices_path, &base_dir, "voices-v1.0.bin"),
            tokenizer_path: path_or(&config.tokenizer_path, &base_dir, "tokenizer.json"),
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.session.is_some()
    }

    pub fn list_voices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.voices.keys().cloned().collect();
        names.sort();
        names
    }

    /// Load the ONNX model, tokenizer, voices, and phonemizer.
    fn load_model(&mut self) -> Result<(), SynthesisError> {
        let t0 = Instant::now();

        // 1. Load tokenizer vocabulary
        info!("Loading tokenizer from {}", self.tokenizer_path.display());
        self.vocab = load_tokenizer(&self.tokenizer_path).map_err(SynthesisError::Engine)?;
        info!("Tokenizer loaded: {} tokens", self.vocab.len());

        // 2. Load voice styles from NPZ
        info!("Loading voices from {}", self.voices_path.display());
        self.voices = load_voices(&self.voices_path).map_err(SynthesisError::Engine)?;
        info!("Loaded {} voices", self.voices.len());

        // 3. Load ONNX model
        info!("Loading ONNX model from {}", self.model_path.display());
        let session = ort::session::Session::builder()
            .map_err(|e| SynthesisError::Engine(format!("Failed to create ONNX session builder: {e}")))?
            .with_optimization_level(ort::session::builder::GraphOptimizationLevel::Level3)
            .map_err(|e| SynthesisError::Engine(format!("Failed to set optimization level: {e}")))?
            .with_intra_threads(self.threads)
            .map_err(|e| SynthesisError::Engine(format!("Failed to set thread count: {e}")))?
            .commit_from_file(&self.model_path)
            .map_err(|e| SynthesisError::Engine(format!("Failed to load ONNX model: {e}")))?;
        self.session = Some(session);

        // 4. Initialize phonemizer (misaki-rs G2P)
        info!("Initializing misaki-rs phonemizer...");
        self.phonemizer = Some(misaki_rs::G2P::new(misaki_rs::Language::EnglishUS));

        info!("Kokoro TTS loaded in {}ms", t0.elapsed().as_millis());
        Ok(())
    }

    /// Generate audio samples for a single sentence.
    fn generate_audio(&mut self, text: &str, voice: &str, speed: f32) -> Result<Vec<f32>, SynthesisError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| SynthesisError::Engine("model not loaded".into()))?;
        let phonemizer = self
            .phonemizer
            .as_ref()
            .ok_or_else(|| SynthesisError::Engine("phonemizer not loaded".into()))?;

        // 1. Text → phonemes via misaki-rs G2P
        let (phonemes, _tokens) = phonemizer
            .g2p(text)
            .map_err(|e| SynthesisError::Unknown(format!("Phonemization failed: {e}")))?;

        if phonemes.is_empty() {
            return Ok(Vec::new());
        }

        // 2. Phonemes → token IDs
        let mut token_ids: Vec<i64> = Vec::with_capacity(phonemes.len() + 2);
        token_ids.push(0); // Start padding
        token_ids.extend(phonemes.chars().filter_map(|ch| self.vocab.get(&ch).copied()));
        token_ids.push(0); // End padding

        let n_tokens = token_ids.len().min(MAX_TOKENS);
        token_ids.truncate(n_tokens);

        // 3. Style vector for this token count
        let voice_data = self
            .voices
            .get(voice)
            .ok_or_else(|| SynthesisError::Unknown(format!("Voice not found: {voice}")))?;
        let style_idx = (n_tokens.saturating_sub(2)).min(voice_data.styles.nrows().saturating_sub(1));
        let style_vec: Vec<f32> = voice_data.styles.row(style_idx).to_vec();

        // 4. Build ONNX input tensors
        let tokens_array = Array2::from_shape_vec((1, n_tokens), token_ids)
            .map_err(|e| SynthesisError::Unknown(format!("Failed to create tokens tensor: {e}")))?;
        let tokens_tensor = Tensor::from_array(tokens_array).map_err(|e| SynthesisError::Unknown(format!("Failed to create tokens ort tensor: {e}")))?;

        let style_array = Array2::from_shape_vec((1, 256), style_vec)
            .map_err(|e| SynthesisError::Unknown(format!("Failed to create style tensor: {e}")))?;
        let style_tensor = Tensor::from_array(style_array).map_err(|e| SynthesisError::Unknown(format!("Failed to create style ort tensor: {e}")))?;

        let speed_array = ndarray::Array1::from_vec(vec![speed]);
        let speed_tensor = Tensor::from_array(speed_array).map_err(|e| SynthesisError::Unknown(format!("Failed to create speed ort tensor: {e}")))?;

        // 5. Run ONNX inference
        let outputs = session
            .run(ort::inputs![
                "tokens" => tokens_tensor,
                "style" => style_tensor,
                "speed" => speed_tensor
            ])
            .map_err(|e| SynthesisError::Unknown(format!("ONNX inference failed: {e}")))?;

        // 6. Extract audio samples from output
        let first_output = outputs
            .iter()
            .next()
            .ok_or_else(|| SynthesisError::Unknown("No output tensor from model".into()))?;
        let (_shape, audio_slice) = first_output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| SynthesisError::Unknown(format!("Failed to extract audio tensor: {e}")))?;

        let samples: Vec<f32> = audio_slice.to_vec();
        debug!(
            "Generated {} samples ({:.1}s)",
            samples.len(),
            samples.len() as f32 / SAMPLE_RATE as f32
        );
        Ok(samples)
    }

    fn render_segment(
        &mut self,
        text: &str,
        prosody: Prosody,
        voice: &str,
        out: &mut Vec<f32>,
    ) -> Result<(), SynthesisError> {
        if let Some(pitch) = prosody.pitch {
            debug!("Pitch '{pitch}' has no Kokoro equivalent, ignoring");
        }
        let speed = self.speed * rate_multiplier(prosody.rate);
        for sentence in split_sentences(text.trim()) {
            let samples = self.generate_audio(sentence, voice, speed)?;
            out.extend_from_slice(&samples);
        }
        Ok(())
    }
}

impl Synthesizer for KokoroSynthesizer {
    fn sample_rate(&self) -> u32 {
        SAMPLE_RATE
    }

    fn configure(&mut self) -> Result<(), SynthesisError> {
        info!("configure...");
        if !self.is_loaded() {
            self.load_model()?;
        }
        if !self.voices.contains_key(&self.default_voice) {
            return Err(SynthesisError::Engine(format!(
                "default voice '{}' not in voices file (available: {})",
                self.default_voice,
                self.list_voices().join(", ")
            )));
        }
        if self.warmup {
            info!("warmup...");
            let voice = self.default_voice.clone();
            self.generate_audio("a", &voice, self.speed)?;
        }
        Ok(())
    }

    fn synthesize(
        &mut self,
        markup: &str,
        speaker: Option<&SpeakerId>,
    ) -> Result<AudioBuffer, SynthesisError> {
        let segments = markup::parse(markup)?;
        let voice = speaker
            .map(|s| s.as_str().to_string())
            .unwrap_or_else(|| self.default_voice.clone());

        let t0 = Instant::now();
        let mut audio: Vec<f32> = Vec::new();
        for segment in segments {
            match segment {
                Segment::Speech { text, prosody } => {
                    self.render_segment(&text, prosody, &voice, &mut audio)?;
                }
                Segment::Pause(duration) => {
                    let n = (duration.as_secs_f64() * SAMPLE_RATE as f64) as usize;
                    audio.resize(audio.len() + n, 0.0);
                }
            }
        }

        let buffer = AudioBuffer::from_f32(SAMPLE_RATE, &audio);
        debug!(
            "Synthesized {:.1}s with voice {voice} in {}ms",
            buffer.duration_secs(),
            t0.elapsed().as_millis()
        );
        Ok(buffer)
    }
}

// --- Helper functions ---

/// Load tokenizer vocabulary from tokenizer.json.
fn load_tokenizer(path: &Path) -> Result<HashMap<char, i64>, String> {
    let contents = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read tokenizer: {e}"))?;
    parse_tokenizer(&contents)
}

fn parse_tokenizer(contents: &str) -> Result<HashMap<char, i64>, String> {
    let data: serde_json::Value = serde_json::from_str(contents)
        .map_err(|e| format!("Failed to parse tokenizer JSON: {e}"))?;

    let vocab = data["model"]["vocab"]
        .as_object()
        .ok_or("Missing model.vocab in tokenizer.json")?;

    let mut map = HashMap::new();
    for (token, id) in vocab {
        let id = id.as_i64().ok_or("Token ID is not an integer")?;
        // Each token should be a single character
        if let Some(ch) = token.chars().next() {
            map.insert(ch, id);
        }
    }

    Ok(map)
}

/// Load all voice styles from an NPZ file.
fn load_voices(path: &Path) -> Result<HashMap<String, VoiceData>, String> {
    let file = fs::File::open(path)
        .map_err(|e| format!("Failed to open voices file: {e}"))?;

    let mut npz = NpzReader::new(file)
        .map_err(|e| format!("Failed to read NPZ voices file: {e}"))?;

    let names: Vec<String> = npz
        .names()
        .map_err(|e| format!("Failed to list NPZ entries: {e}"))?
        .into_iter()
        .map(|n| n.trim_end_matches(".npy").to_string())
        .collect();

    let mut voices = HashMap::new();
    for name in &names {
        let npy_name = format!("{name}.npy");
        let arr: Array3<f32> = npz
            .by_name(&npy_name)
            .map_err(|e| format!("Failed to read voice '{name}': {e}"))?;

        // Shape is (510, 1, 256). Squeeze the middle dimension to (510, 256).
        let dim0 = arr.shape()[0];
        let dim2 = arr.shape()[2];
        let styles = arr
            .into_shape_with_order((dim0, dim2))
            .map_err(|e| format!("Failed to reshape voice '{name}': {e}"))?;

        voices.insert(name.clone(), VoiceData { styles });
    }

    Ok(voices)
}

/// Split text into sentences at .!? boundaries.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut sentences = Vec::new();
    let mut start = 0;
    let bytes = text.as_bytes();

    for (i, &b) in bytes.iter().enumerate() {
        if (b == b'.' || b == b'!' || b == b'?')
            && i + 1 < bytes.len()
            && bytes[i + 1].is_ascii_whitespace()
        {
            let end = i + 1;
            let s = text[start..end].trim();
            if !s.is_empty() {
                sentences.push(s);
            }
            start = end;
        }
    }

    let s = text[start..].trim();
    if !s.is_empty() {
        sentences.push(s);
    }

    sentences
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sentences_split_on_terminal_punctuation() {
        assert_eq!(
            split_sentences("Hi there. How are you? Fine!"),
            vec!["Hi there.", "How are you?", "Fine!"]
        );
        assert_eq!(split_sentences("v1.2 is out"), vec!["v1.2 is out"]);
        assert!(split_sentences("   ").is_empty());
    }

    #[test]
    fn rate_levels_map_to_speed() {
        assert_eq!(rate_multiplier(None), 1.0);
        assert_eq!(rate_multiplier(Some("medium")), 1.0);
        assert!(rate_multiplier(Some("x-slow")) < rate_multiplier(Some("slow")));
        assert!(rate_multiplier(Some("fast")) < rate_multiplier(Some("x-fast")));
    }

    #[test]
    fn tokenizer_vocab_is_read_per_char() {
        let vocab = parse_tokenizer(r#"{"model":{"vocab":{"a":1,"ə":2}}}"#).unwrap();
        assert_eq!(vocab.get(&'a'), Some(&1));
        assert_eq!(vocab.get(&'ə'), Some(&2));
        assert!(parse_tokenizer(r#"{"model":{}}"#).is_err());
    }

    #[test]
    fn unloaded_engine_rejects_markup_before_inference() {
        let mut synth = KokoroSynthesizer::new(&TtsConfig::default(), "af_heart");
        assert!(matches!(
            synth.synthesize("<speak>hi", None),
            Err(SynthesisError::MalformedMarkup(_))
        ));
        assert!(matches!(
            synth.synthesize("<speak>hi</speak>", None),
            Err(SynthesisError::Engine(_))
        ));
        assert!(synth.synthesize("<speak></speak>", None).unwrap().is_empty());
    }

    #[test]
    fn missing_model_files_fail_configure() {
        let config = TtsConfig {
            tokenizer_path: "/nonexistent/tokenizer.json".into(),
            ..TtsConfig::default()
        };
        let mut synth = KokoroSynthesizer::new(&config, "af_heart");
        assert!(matches!(synth.configure(), Err(SynthesisError::Engine(_))));
        assert_eq!(synth.sample_rate(), SAMPLE_RATE);
    }
}
