//! **Speech-to-Text (STT)** capability consumed by the pipeline.
//!
//! Implement `Transcriber` for a streaming provider (frames in, final
//! transcripts out) or a batch provider that transcribes whole segments on
//! `end_segment`. Events flow back over the channel handed to `start`.

use crate::audio::AudioFrame;
use crate::error::VoiceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Options recognized by transcription providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TranscriptionConfig {
    pub model: String,
    pub punctuate: bool,
    pub language: String,
    pub encoding: String,
    pub sample_rate: u32,
}

impl Default for TranscriptionConfig {
    fn default() -> Self {
        Self {
            model: "nova-3".to_string(),
            punctuate: true,
            language: "en-US".to_string(),
            encoding: "linear16".to_string(),
            sample_rate: 16000,
        }
    }
}

/// Events delivered by a transcription session.
#[derive(Debug, Clone, PartialEq)]
pub enum TranscriptionEvent {
    Ready,
    /// A final transcript for one utterance.
    Transcript(String),
    Error(String),
    Closed,
}

/// Transcription capability.
///
/// Frames sent while `is_ready()` is false are dropped by the caller; the
/// provider is not expected to buffer them. Closing or erroring does not
/// reconnect on its own.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Open a session. Failure is a [`crate::VoiceError::Connection`].
    async fn start(
        &mut self,
        config: &TranscriptionConfig,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
    ) -> VoiceResult<()>;

    /// Close the session. Safe to call when not started.
    async fn stop(&mut self) -> VoiceResult<()>;

    fn send_audio(&mut self, frame: &AudioFrame);

    /// Called after the last frame of a speech segment.
    fn end_segment(&mut self) {}

    fn is_ready(&self) -> bool;
}
