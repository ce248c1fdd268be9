//! HTTP-backed capability implementations.
//!
//! - [`openai`]: chat completions (streaming, tools), speech and transcription
//!   on any OpenAI-compatible API.
//! - [`cartesia`]: Cartesia byte-output speech synthesis.
//! - [`deepgram`]: Deepgram live transcription over a WebSocket.

pub mod cartesia;
pub mod deepgram;
pub mod openai;

pub use cartesia::CartesiaTts;
pub use deepgram::DeepgramTranscriber;
pub use openai::{OpenAiChat, OpenAiSpeech, OpenAiTranscriber};

use crate::error::{VoiceError, VoiceResult};
use std::time::Duration;

/// Turn a non-2xx response into a provider error carrying the body.
pub(crate) async fn error_for_status(
    res: reqwest::Response,
    wrap: fn(String) -> VoiceError,
) -> VoiceResult<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    Err(wrap(format!("API error {}: {}", status, body)))
}

pub(crate) fn http_client(timeout: Duration, wrap: fn(String) -> VoiceError) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| wrap(e.to_string()))
}

/// First set env var among `names`.
pub(crate) fn env_any(names: &[&str]) -> Option<String> {
    names
        .iter()
        .find_map(|name| std::env::var(name).ok().filter(|v| !v.trim().is_empty()))
}

/// Splits a server-sent-events byte stream into `data:` payloads.
///
/// Chunks may end mid-line (or mid-character); the tail is kept until the
/// next newline arrives.
#[derive(Debug, Default)]
pub(crate) struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut payloads = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(|c| c == '\n' || c == '\r');
            if let Some(data) = line.strip_prefix("data:") {
                payloads.push(data.trim_start().to_string());
            }
        }
        payloads
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_lines_split_across_chunks() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\"").is_empty());
        assert_eq!(decoder.push(b":1}\r\n\r\ndata: [DONE]\n"), vec!["{\"a\":1}", "[DONE]"]);
    }

    #[test]
    fn sse_ignores_comments_and_event_lines() {
        let mut decoder = SseDecoder::default();
        let payloads = decoder.push(b": keep-alive\nevent: message\ndata: x\n");
        assert_eq!(payloads, vec!["x"]);
    }

    #[test]
    fn sse_keeps_split_utf8_intact() {
        let mut decoder = SseDecoder::default();
        let bytes = "data: héllo\n".as_bytes();
        let (head, tail) = bytes.split_at(8); // splits the two-byte 'é'
        assert!(decoder.push(head).is_empty());
        assert_eq!(decoder.push(tail), vec!["héllo"]);
    }
}
