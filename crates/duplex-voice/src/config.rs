//! Layered configuration: defaults, then a TOML file, then `DUPLEX_*` env vars.
//!
//! Nested keys use `__` in env vars, e.g. `DUPLEX_VAD__MIN_SPEECH_MS=300`
//! or `DUPLEX_GENERATION__MODEL=gpt-4o-mini`.

use crate::audio::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::llm::GenerationConfig;
use crate::pipeline::{InputMode, PipelineConfig};
use crate::stt::TranscriptionConfig;
use crate::tts::SynthesisConfig;
use crate::vad::VadConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

/// Env var naming the config file. Falls back to `duplex.toml` when present.
pub const CONFIG_PATH_ENV: &str = "DUPLEX_CONFIG";
const DEFAULT_CONFIG_FILE: &str = "duplex.toml";

/// Everything needed to assemble a pipeline and its providers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub mode: InputMode,
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub transcription: TranscriptionConfig,
    pub generation: GenerationConfig,
    pub synthesis: SynthesisConfig,
}

impl VoiceConfig {
    /// Load from `DUPLEX_CONFIG` (or `duplex.toml` if it exists) plus the environment.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        let path = Path::new(&path);
        if path.exists() {
            Self::load_from(Some(path))
        } else {
            Self::load_from(None)
        }
    }

    /// Load from an explicit file (which must exist) plus the environment.
    pub fn load_from(path: Option<&Path>) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = match path {
            Some(path) => {
                info!("📄 Loading config from {}", path.display());
                builder.add_source(
                    config::File::from(path)
                        .format(config::FileFormat::Toml)
                        .required(true),
                )
            }
            None => builder,
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("DUPLEX")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| VoiceError::Config(e.to_string()))?;

        let config: Self = built
            .try_deserialize()
            .map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(s: &str) -> VoiceResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| VoiceError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        self.vad.validate()?;
        if self.audio.sample_rate != self.vad.sample_rate {
            return Err(VoiceError::Config(format!(
                "audio sample rate ({}) must match VAD sample rate ({})",
                self.audio.sample_rate, self.vad.sample_rate
            )));
        }
        if self.transcription.sample_rate != self.audio.sample_rate {
            return Err(VoiceError::Config(format!(
                "transcription sample rate ({}) must match audio sample rate ({})",
                self.transcription.sample_rate, self.audio.sample_rate
            )));
        }
        if self.generation.history_window == 0 {
            return Err(VoiceError::Config("history_window must be at least 1".to_string()));
        }
        Ok(())
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            mode: self.mode,
            vad: self.vad.clone(),
            transcription: self.transcription.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_consistent() {
        let config = VoiceConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.mode, InputMode::Voice);
        assert_eq!(config.generation.model, "gpt-3.5-turbo");
        assert_eq!(config.generation.max_tokens, 100);
        assert_eq!(config.synthesis.output_format.sample_rate, 44100);
        assert_eq!(config.vad.sample_rate, 16000);
    }

    #[test]
    fn toml_overrides_only_named_keys() {
        let config = VoiceConfig::from_toml_str(
            r#"
            mode = "text"

            [vad]
            min_speech_ms = 400
            end_silence_ms = 300

            [generation]
            model = "gpt-4o-mini"
            "#,
        )
        .unwrap();
        assert_eq!(config.mode, InputMode::Text);
        assert_eq!(config.vad.min_speech_ms, 400);
        assert_eq!(config.vad.end_silence_ms, 300);
        assert_eq!(config.vad.max_segment_ms, 30_000);
        assert_eq!(config.generation.model, "gpt-4o-mini");
        assert_eq!(config.generation.history_window, 10);
    }

    #[test]
    fn mismatched_sample_rates_are_rejected() {
        let err = VoiceConfig::from_toml_str("[audio]\nsample_rate = 48000").unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }

    #[test]
    fn file_then_env_layering() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[synthesis]\nlanguage = \"de\"\n\n[vad]\nmin_speech_ms = 100").unwrap();

        std::env::set_var("DUPLEX_VAD__MIN_SPEECH_MS", "320");
        let config = VoiceConfig::load_from(Some(file.path()));
        std::env::remove_var("DUPLEX_VAD__MIN_SPEECH_MS");

        let config = config.unwrap();
        assert_eq!(config.synthesis.language, "de");
        assert_eq!(config.vad.min_speech_ms, 320);
        assert_eq!(config.synthesis.model, "sonic-english");
    }

    #[test]
    fn missing_required_file_is_a_config_error() {
        let err = VoiceConfig::load_from(Some(Path::new("/nonexistent/duplex.toml"))).unwrap_err();
        assert!(matches!(err, VoiceError::Config(_)));
    }
}
