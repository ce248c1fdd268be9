//! Deepgram live transcription over the `/v1/listen` WebSocket.
//!
//! Frames go out as binary `linear16` messages while the socket is open.
//! A background reader turns final `Results` messages into transcripts;
//! interim results are skipped.

use super::env_any;
use crate::audio::AudioFrame;
use crate::error::{VoiceError, VoiceResult};
use crate::stt::{Transcriber, TranscriptionConfig, TranscriptionEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::connect_async;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "wss://api.deepgram.com";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct DgMessage {
    #[serde(rename = "type", default)]
    msg_type: String,
    channel: Option<DgChannel>,
    #[serde(default)]
    is_final: bool,
    description: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DgChannel {
    #[serde(default)]
    alternatives: Vec<DgAlternative>,
}

#[derive(Debug, Deserialize)]
struct DgAlternative {
    #[serde(default)]
    transcript: String,
}

/// Streaming Deepgram transcriber.
pub struct DeepgramTranscriber {
    base_url: String,
    api_key: String,
    ready: Arc<AtomicBool>,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
    writer: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
}

impl DeepgramTranscriber {
    /// Build from environment: DEEPGRAM_API_KEY, optional DEEPGRAM_API_URL.
    pub fn from_env() -> VoiceResult<Self> {
        let api_key = env_any(&["DEEPGRAM_API_KEY"])
            .ok_or_else(|| VoiceError::Config("Deepgram STT requires DEEPGRAM_API_KEY".to_string()))?;
        let base_url = env_any(&["DEEPGRAM_API_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Ok(Self::new(base_url, api_key))
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            ready: Arc::new(AtomicBool::new(false)),
            outgoing: None,
            writer: None,
            reader: None,
        }
    }

    fn listen_url(&self, config: &TranscriptionConfig) -> VoiceResult<reqwest::Url> {
        let base = format!("{}/v1/listen", self.base_url.trim_end_matches('/'));
        let mut url = reqwest::Url::parse(&base)
            .map_err(|e| VoiceError::Connection(format!("invalid Deepgram URL {}: {}", base, e)))?;
        url.query_pairs_mut()
            .append_pair("model", &config.model)
            .append_pair("language", &config.language)
            .append_pair("punctuate", if config.punctuate { "true" } else { "false" })
            .append_pair("encoding", &config.encoding)
            .append_pair("sample_rate", &config.sample_rate.to_string())
            .append_pair("channels", "1");
        Ok(url)
    }

    fn queue(&self, message: Message) -> bool {
        match &self.outgoing {
            Some(tx) => tx.send(message).is_ok(),
            None => false,
        }
    }
}

/// Map one server text message to the event it carries, if any.
fn parse_message(text: &str) -> Option<TranscriptionEvent> {
    let msg: DgMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            warn!("Unparseable Deepgram message: {}", e);
            return None;
        }
    };
    match msg.msg_type.as_str() {
        "Results" if msg.is_final => {
            let transcript = msg
                .channel
                .and_then(|c| c.alternatives.into_iter().next())
                .map(|a| a.transcript)
                .unwrap_or_default();
            if transcript.trim().is_empty() {
                None
            } else {
                Some(TranscriptionEvent::Transcript(transcript))
            }
        }
        "Error" => Some(TranscriptionEvent::Error(
            msg.description
                .or(msg.message)
                .unwrap_or_else(|| "unknown Deepgram error".to_string()),
        )),
        _ => None,
    }
}

#[async_trait]
impl Transcriber for DeepgramTranscriber {
    async fn start(
        &mut self,
        config: &TranscriptionConfig,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
    ) -> VoiceResult<()> {
        if config.encoding != "linear16" {
            return Err(VoiceError::Connection(format!(
                "capture frames are PCM16, cannot stream as {}",
                config.encoding
            )));
        }
        if self.outgoing.is_some() {
            self.stop().await?;
        }

        let url = self.listen_url(config)?;
        debug!("Connecting to {}", url);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| VoiceError::Connection(e.to_string()))?;
        let auth = HeaderValue::from_str(&format!("Token {}", self.api_key))
            .map_err(|e| VoiceError::Connection(format!("invalid API key header: {}", e)))?;
        request.headers_mut().insert("Authorization", auth);

        let (socket, _) = match tokio::time::timeout(CONNECT_TIMEOUT, connect_async(request)).await {
            Ok(Ok(connected)) => connected,
            Ok(Err(e)) => return Err(VoiceError::Connection(e.to_string())),
            Err(_) => {
                return Err(VoiceError::Connection(format!(
                    "Deepgram connection timed out after {:?}",
                    CONNECT_TIMEOUT
                )))
            }
        };
        let (mut sink, mut stream) = socket.split();

        let (outgoing, mut queued) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = queued.recv().await {
                if let Err(e) = sink.send(message).await {
                    warn!("Deepgram send failed: {}", e);
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let ready = Arc::clone(&self.ready);
        let reader_events = events.clone();
        let reader = tokio::spawn(async move {
            while let Some(next) = stream.next().await {
                match next {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_message(&text) {
                            let _ = reader_events.send(event);
                        }
                    }
                    Ok(Message::Close(frame)) => {
                        debug!("Deepgram closed the stream: {:?}", frame);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        let _ = reader_events.send(TranscriptionEvent::Error(e.to_string()));
                        break;
                    }
                }
            }
            ready.store(false, Ordering::SeqCst);
            let _ = reader_events.send(TranscriptionEvent::Closed);
        });

        self.outgoing = Some(outgoing);
        self.writer = Some(writer);
        self.reader = Some(reader);
        self.ready.store(true, Ordering::SeqCst);
        let _ = events.send(TranscriptionEvent::Ready);
        info!("✅ Deepgram session open ({}, {})", config.model, config.language);
        Ok(())
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        self.ready.store(false, Ordering::SeqCst);
        if self.outgoing.is_some() {
            self.queue(Message::Text(r#"{"type":"CloseStream"}"#.to_string().into()));
        }
        // Dropping the queue lets the writer flush and close the socket
        self.outgoing = None;

        if let Some(writer) = self.writer.take() {
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, writer).await.is_err() {
                warn!("Deepgram writer did not finish in time");
            }
        }
        if let Some(reader) = self.reader.take() {
            let abort = reader.abort_handle();
            if tokio::time::timeout(SHUTDOWN_TIMEOUT, reader).await.is_err() {
                warn!("Deepgram reader did not finish in time, aborting");
                abort.abort();
            }
            info!("🛑 Deepgram session closed");
        }
        Ok(())
    }

    fn send_audio(&mut self, frame: &AudioFrame) {
        if self.is_ready() && !self.queue(Message::Binary(frame.to_le_bytes().into())) {
            warn!("Deepgram writer gone, dropping frame");
        }
    }

    /// Ask the server to flush its pending transcript for this utterance.
    fn end_segment(&mut self) {
        if self.is_ready() {
            self.queue(Message::Text(r#"{"type":"Finalize"}"#.to_string().into()));
        }
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }
}
