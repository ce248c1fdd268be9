//! Cartesia speech synthesis over the `/tts/bytes` endpoint.

use super::{env_any, error_for_status, http_client};
use crate::error::{VoiceError, VoiceResult};
use crate::tts::{SpeechSynthesizer, SynthesisConfig};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const DEFAULT_BASE_URL: &str = "https://api.cartesia.ai";
const API_VERSION: &str = "2024-06-10";

/// Cartesia TTS. Returns audio in the configured output format (WAV by default).
#[derive(Debug, Clone)]
pub struct CartesiaTts {
    base_url: String,
    api_key: String,
    config: SynthesisConfig,
    client: reqwest::Client,
}

impl CartesiaTts {
    /// Build from environment: CARTESIA_API_KEY, optional CARTESIA_API_URL.
    pub fn from_env(config: SynthesisConfig) -> VoiceResult<Self> {
        let api_key = env_any(&["CARTESIA_API_KEY"])
            .ok_or_else(|| VoiceError::Config("Cartesia TTS requires CARTESIA_API_KEY".to_string()))?;
        let base_url = env_any(&["CARTESIA_API_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self::new(base_url, api_key, config)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: SynthesisConfig,
    ) -> VoiceResult<Self> {
        let client = http_client(Duration::from_secs(60), VoiceError::Synthesis)?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            config,
            client,
        })
    }

    fn request_body(&self, text: &str) -> Value {
        let format = &self.config.output_format;
        json!({
            "model_id": self.config.model,
            "transcript": text,
            "voice": {"mode": "id", "id": self.config.voice_id},
            "language": self.config.language,
            "output_format": {
                "container": format.container,
                "sample_rate": format.sample_rate,
                "encoding": format.encoding,
            },
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for CartesiaTts {
    async fn text_to_speech(&self, text: &str, cancel: &CancellationToken) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/tts/bytes", self.base_url.trim_end_matches('/'));
        let body = self.request_body(text);
        debug!("Cartesia synthesis: {} chars", text.len());

        let request = async {
            let res = self
                .client
                .post(&url)
                .header("X-API-Key", &self.api_key)
                .header("Cartesia-Version", API_VERSION)
                .json(&body)
                .send()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            let res = error_for_status(res, VoiceError::Synthesis).await?;
            let bytes = res
                .bytes()
                .await
                .map_err(|e| VoiceError::Synthesis(e.to_string()))?;
            Ok::<_, VoiceError>(bytes.to_vec())
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            audio = request => audio,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_uses_single_voice_identity_and_wav_format() {
        let tts = CartesiaTts::new("http://localhost:1", "key", SynthesisConfig::default()).unwrap();
        let body = tts.request_body("OK, done.");
        assert_eq!(body["model_id"], "sonic-english");
        assert_eq!(body["transcript"], "OK, done.");
        assert_eq!(body["voice"]["mode"], "id");
        assert_eq!(body["voice"]["id"], "a0e99841-438c-4a64-b679-ae501e7d6091");
        assert_eq!(body["language"], "en");
        assert_eq!(body["output_format"]["container"], "wav");
        assert_eq!(body["output_format"]["sample_rate"], 44100);
        assert_eq!(body["output_format"]["encoding"], "pcm_f32le");
    }

    #[tokio::test]
    async fn blank_text_skips_the_request() {
        let tts = CartesiaTts::new("http://localhost:1", "key", SynthesisConfig::default()).unwrap();
        let audio = tts.text_to_speech("   ", &CancellationToken::new()).await.unwrap();
        assert!(audio.is_empty());
    }
}
