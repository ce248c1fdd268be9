//! Error types for the duplex voice loop

use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur anywhere in the dialogue loop
#[derive(Error, Debug)]
pub enum VoiceError {
    /// Capture device unavailable or failed after start.
    #[error("Audio acquisition error: {0}")]
    Acquisition(String),

    /// Transcription capability failed to establish.
    #[error("Transcription connection error: {0}")]
    Connection(String),

    /// Transcription capability reported an error on an open session.
    #[error("Transcription error: {0}")]
    Transcription(String),

    /// Language-model call or stream failed.
    #[error("Generation error: {0}")]
    Generation(String),

    /// Speech-synthesis call failed.
    #[error("Synthesis error: {0}")]
    Synthesis(String),

    /// A registered tool handler failed or its arguments did not parse.
    #[error("Tool handler '{tool}' failed: {reason}")]
    Handler { tool: String, reason: String },

    /// Operation is not legal in the current pipeline state or mode.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("VAD processing error: {0}")]
    VadProcessing(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Channel send error: {0}")]
    ChannelSend(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("WAV encoding error: {0}")]
    Wav(#[from] hound::Error),
}

/// Copyable discriminant of [`VoiceError`], carried on pipeline error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Acquisition,
    Connection,
    Transcription,
    Generation,
    Synthesis,
    Handler,
    InvalidState,
    Vad,
    Playback,
    Config,
    Channel,
    Cancelled,
    Io,
}

impl VoiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            VoiceError::Acquisition(_) => ErrorKind::Acquisition,
            VoiceError::Connection(_) => ErrorKind::Connection,
            VoiceError::Transcription(_) => ErrorKind::Transcription,
            VoiceError::Generation(_) => ErrorKind::Generation,
            VoiceError::Synthesis(_) => ErrorKind::Synthesis,
            VoiceError::Handler { .. } => ErrorKind::Handler,
            VoiceError::InvalidState(_) => ErrorKind::InvalidState,
            VoiceError::VadProcessing(_) => ErrorKind::Vad,
            VoiceError::Playback(_) => ErrorKind::Playback,
            VoiceError::Config(_) => ErrorKind::Config,
            VoiceError::ChannelSend(_) => ErrorKind::Channel,
            VoiceError::Cancelled => ErrorKind::Cancelled,
            VoiceError::Io(_) | VoiceError::Json(_) | VoiceError::Http(_) | VoiceError::Wav(_) => {
                ErrorKind::Io
            }
        }
    }
}

#[cfg(feature = "device")]
impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::Acquisition(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        VoiceError::Acquisition(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        VoiceError::Acquisition(err.to_string())
    }
}

#[cfg(feature = "device")]
impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        VoiceError::Acquisition(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handler_error_message_names_tool() {
        let err = VoiceError::Handler {
            tool: "log_x".to_string(),
            reason: "boom".to_string(),
        };
        assert_eq!(err.to_string(), "Tool handler 'log_x' failed: boom");
        assert_eq!(err.kind(), ErrorKind::Handler);
    }
}
