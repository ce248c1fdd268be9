//! Speaker playback for synthesized replies (feature `device`).
//!
//! Plays `PipelineEvent::AudioReady` bytes on the default output device.
//! On `PipelineEvent::Interrupted`, call `stop()` to clear the queue.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::io::Cursor;
use tracing::{debug, info};

/// Queue-based playback on the default output device. Not `Send`.
pub struct VoiceOutput {
    _stream: OutputStream,
    _stream_handle: OutputStreamHandle,
    sink: Sink,
}

impl VoiceOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (stream, stream_handle) =
            OutputStream::try_default().map_err(|e| VoiceError::Playback(e.to_string()))?;
        let sink = Sink::try_new(&stream_handle).map_err(|e| VoiceError::Playback(e.to_string()))?;
        info!("🔊 Output sink ready");
        Ok(Self {
            _stream: stream,
            _stream_handle: stream_handle,
            sink,
        })
    }

    /// Queue encoded audio (WAV, MP3, ...). Empty input is a no-op.
    pub fn play_bytes(&self, bytes: &[u8]) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let source = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        debug!(
            "Queued {} bytes ({:?})",
            bytes.len(),
            source.total_duration().unwrap_or_default()
        );
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    /// Stop playback immediately and clear the queue.
    pub fn stop(&self) {
        self.sink.stop();
        info!("🔇 Playback stopped");
    }

    /// Whether anything is queued or playing.
    pub fn is_playing(&self) -> bool {
        !self.sink.empty()
    }

    /// Block until the queue drains.
    pub fn sleep_until_end(&self) {
        self.sink.sleep_until_end();
    }
}
