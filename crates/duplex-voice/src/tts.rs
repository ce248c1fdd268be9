//! Speech-synthesis capability consumed by the pipeline.

use crate::error::VoiceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Output format requested from a synthesis provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputFormat {
    pub container: String,
    pub sample_rate: u32,
    pub encoding: String,
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self {
            container: "wav".to_string(),
            sample_rate: 44100,
            encoding: "pcm_f32le".to_string(),
        }
    }
}

/// Synthesis settings: single voice identity, WAV 44.1 kHz f32 by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    pub model: String,
    pub voice_id: String,
    pub language: String,
    pub output_format: OutputFormat,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            model: "sonic-english".to_string(),
            voice_id: "a0e99841-438c-4a64-b679-ae501e7d6091".to_string(),
            language: "en".to_string(),
            output_format: OutputFormat::default(),
        }
    }
}

/// Turns text into raw audio bytes. Return an empty vec to skip playback.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Failure is a [`crate::VoiceError::Synthesis`]. Implementations should
    /// return [`crate::VoiceError::Cancelled`] once `cancel` fires.
    async fn text_to_speech(&self, text: &str, cancel: &CancellationToken) -> VoiceResult<Vec<u8>>;
}
