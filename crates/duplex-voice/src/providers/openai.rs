//! OpenAI-compatible providers: chat completions, speech, transcription.
//!
//! Works against OpenAI itself or any server exposing the same routes
//! (`/chat/completions`, `/audio/speech`, `/audio/transcriptions`).

use super::{env_any, error_for_status, http_client, SseDecoder};
use crate::audio::{encode_wav, AudioFrame};
use crate::context::{Message, Role};
use crate::error::{VoiceError, VoiceResult};
use crate::llm::{
    FragmentStream, GenerationConfig, GenerationRequest, LanguageModel, ResponseFragment,
    ToolCallAccumulator,
};
use crate::stt::{Transcriber, TranscriptionConfig, TranscriptionEvent};
use crate::tts::SpeechSynthesizer;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

fn base_url_from_env(specific: &str) -> String {
    env_any(&[specific, "OPENAI_BASE_URL"]).unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

fn api_key_from_env(specific: &str) -> VoiceResult<String> {
    env_any(&[specific, "OPENAI_API_KEY"])
        .ok_or_else(|| VoiceError::Config(format!("requires {} or OPENAI_API_KEY", specific)))
}

fn endpoint(base_url: &str, route: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), route)
}

// -----------------------------------------------------------------------------
// Chat completions
// -----------------------------------------------------------------------------

/// Streaming chat-completions model with tool calling.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    base_url: String,
    api_key: String,
    config: GenerationConfig,
    client: reqwest::Client,
}

impl OpenAiChat {
    /// Build from environment: LLM_API_URL (or OPENAI_BASE_URL), LLM_API_KEY (or OPENAI_API_KEY).
    pub fn from_env(config: GenerationConfig) -> VoiceResult<Self> {
        let base_url = base_url_from_env("LLM_API_URL");
        let api_key = api_key_from_env("LLM_API_KEY")?;
        Self::new(base_url, api_key, config)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        config: GenerationConfig,
    ) -> VoiceResult<Self> {
        let client = http_client(Duration::from_secs(60), VoiceError::Generation)?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            config,
            client,
        })
    }

    fn request_body(&self, request: &GenerationRequest) -> Value {
        let mut messages = Vec::with_capacity(request.messages.len() + 1);
        // A window that opens with its own system message replaces the configured prompt
        let pinned = request
            .messages
            .first()
            .is_some_and(|m| m.role == Role::System && !m.is_tool_call());
        if !pinned && !self.config.system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": self.config.system_prompt}));
        }
        messages.extend(request.messages.iter().map(message_json));

        let mut body = json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": self.config.max_tokens,
            "stream": true,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

/// Tool calls are sent back as notes: the API rejects an assistant
/// `tool_calls` message without matching tool results.
fn message_json(message: &Message) -> Value {
    match &message.tool_call {
        Some(call) => json!({
            "role": "system",
            "content": format!("Tool `{}` was called with arguments {}", call.name, call.arguments_json),
        }),
        None => json!({"role": message.role.as_str(), "content": message.content}),
    }
}

impl LanguageModel for OpenAiChat {
    fn process_text(&self, request: GenerationRequest) -> FragmentStream {
        let body = self.request_body(&request);
        let send = self
            .client
            .post(endpoint(&self.base_url, "chat/completions"))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();
        debug!(model = %self.config.model, messages = request.messages.len(), "Starting chat completion");
        Box::pin(chat_stream(send, request.cancel))
    }
}

fn chat_stream<F>(
    send: F,
    cancel: CancellationToken,
) -> impl Stream<Item = VoiceResult<ResponseFragment>> + Send
where
    F: Future<Output = reqwest::Result<reqwest::Response>> + Send + 'static,
{
    async_stream::try_stream! {
        let response = tokio::select! {
            _ = cancel.cancelled() => Err(VoiceError::Cancelled),
            res = send => res.map_err(|e| VoiceError::Generation(e.to_string())),
        };
        let response = error_for_status(response?, VoiceError::Generation).await?;

        let mut bytes = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut assembler = ReplyAssembler::default();
        while !assembler.done {
            let next = tokio::select! {
                _ = cancel.cancelled() => Err(VoiceError::Cancelled),
                next = bytes.next() => Ok(next),
            };
            let chunk = match next? {
                Some(chunk) => chunk.map_err(|e| VoiceError::Generation(e.to_string()))?,
                None => break,
            };
            for payload in decoder.push(&chunk) {
                for fragment in assembler.apply(&payload)? {
                    yield fragment;
                }
            }
        }
        for fragment in assembler.finish() {
            yield fragment;
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ChunkChoice {
    delta: Option<ChunkDelta>,
}

#[derive(Debug, Deserialize)]
struct ChunkDelta {
    content: Option<String>,
    tool_calls: Option<Vec<ToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct ToolCallDelta {
    #[serde(default)]
    index: usize,
    id: Option<String>,
    function: Option<FunctionDelta>,
}

#[derive(Debug, Default, Deserialize)]
struct FunctionDelta {
    name: Option<String>,
    arguments: Option<String>,
}

/// Folds SSE payloads into reply fragments. Content passes straight
/// through; tool calls are held until the stream ends.
#[derive(Debug, Default)]
struct ReplyAssembler {
    calls: ToolCallAccumulator,
    done: bool,
}

impl ReplyAssembler {
    fn apply(&mut self, payload: &str) -> VoiceResult<Vec<ResponseFragment>> {
        if payload == "[DONE]" {
            self.done = true;
            return Ok(Vec::new());
        }
        let chunk: ChatChunk = serde_json::from_str(payload)
            .map_err(|e| VoiceError::Generation(format!("malformed stream chunk: {}", e)))?;
        if let Some(error) = chunk.error {
            return Err(VoiceError::Generation(error.to_string()));
        }

        let mut fragments = Vec::new();
        for choice in chunk.choices {
            let Some(delta) = choice.delta else {
                continue;
            };
            for call in delta.tool_calls.unwrap_or_default() {
                let function = call.function.unwrap_or_default();
                self.calls.push_delta(
                    call.index,
                    call.id.as_deref(),
                    function.name.as_deref(),
                    function.arguments.as_deref(),
                );
            }
            if let Some(text) = delta.content.filter(|t| !t.is_empty()) {
                fragments.push(ResponseFragment::Content(text));
            }
        }
        Ok(fragments)
    }

    fn finish(&mut self) -> Vec<ResponseFragment> {
        self.calls
            .finish()
            .into_iter()
            .map(ResponseFragment::FunctionCall)
            .collect()
    }
}

// -----------------------------------------------------------------------------
// Speech
// -----------------------------------------------------------------------------

/// `/audio/speech` synthesis. Returns WAV bytes.
#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    base_url: String,
    api_key: String,
    /// tts-1 (fast) or tts-1-hd.
    pub model: String,
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    /// Build from environment: TTS_API_URL, TTS_API_KEY (or the OPENAI_* equivalents), TTS_MODEL, TTS_VOICE.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = base_url_from_env("TTS_API_URL");
        let api_key = api_key_from_env("TTS_API_KEY")?;
        let mut speech = Self::new(base_url, api_key)?;
        if let Some(model) = env_any(&["TTS_MODEL"]) {
            speech.model = model;
        }
        if let Some(voice) = env_any(&["TTS_VOICE"]) {
            speech.voice = voice;
        }
        Ok(speech)
    }

    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = http_client(Duration::from_secs(60), VoiceError::Synthesis)?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            client,
        })
    }

    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiSpeech {
    async fn text_to_speech(&self, text: &str, cancel: &CancellationToken) -> VoiceResult<Vec<u8>> {
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
            "response_format": "wav",
        });
        let request = async {
            let res = self
                .client
                .post(endpoint(&self.base_url, "audio/speech"))
                .bearer_auth(&self.api_key)
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

// -----------------------------------------------------------------------------
// Transcription
// -----------------------------------------------------------------------------

/// Segment-at-a-time transcription over `/audio/transcriptions`.
///
/// Frames are buffered until `end_segment`, then uploaded as one WAV file on
/// a background task; the transcript arrives as a
/// [`TranscriptionEvent::Transcript`]. Must be used inside a Tokio runtime.
pub struct OpenAiTranscriber {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
    language: Option<String>,
    sample_rate: u32,
    buffer: Vec<i16>,
    events: Option<mpsc::UnboundedSender<TranscriptionEvent>>,
}

impl OpenAiTranscriber {
    /// Build from environment: STT_API_URL, STT_API_KEY (or the OPENAI_* equivalents), STT_MODEL.
    pub fn from_env() -> VoiceResult<Self> {
        let base_url = base_url_from_env("STT_API_URL");
        let api_key = api_key_from_env("STT_API_KEY")?;
        let model = env_any(&["STT_MODEL"]).unwrap_or_else(|| "whisper-1".to_string());
        Self::new(base_url, api_key, model)
    }

    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> VoiceResult<Self> {
        let client = http_client(Duration::from_secs(30), VoiceError::Transcription)?;
        Ok(Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            client,
            language: None,
            sample_rate: 16000,
            buffer: Vec::new(),
            events: None,
        })
    }
}

async fn transcribe(
    client: reqwest::Client,
    url: String,
    api_key: String,
    model: String,
    language: Option<String>,
    wav: Vec<u8>,
) -> VoiceResult<String> {
    let part = reqwest::multipart::Part::bytes(wav)
        .file_name("segment.wav")
        .mime_str("audio/wav")
        .map_err(|e| VoiceError::Transcription(e.to_string()))?;
    let mut form = reqwest::multipart::Form::new()
        .part("file", part)
        .text("model", model);
    if let Some(language) = language {
        form = form.text("language", language);
    }

    let res = client
        .post(&url)
        .bearer_auth(&api_key)
        .multipart(form)
        .send()
        .await
        .map_err(|e| VoiceError::Transcription(e.to_string()))?;
    let res = error_for_status(res, VoiceError::Transcription).await?;
    let json: Value = res
        .json()
        .await
        .map_err(|e| VoiceError::Transcription(e.to_string()))?;
    Ok(json
        .get("text")
        .and_then(|t| t.as_str())
        .unwrap_or("")
        .trim()
        .to_string())
}

#[async_trait]
impl Transcriber for OpenAiTranscriber {
    async fn start(
        &mut self,
        config: &TranscriptionConfig,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
    ) -> VoiceResult<()> {
        if self.api_key.is_empty() {
            return Err(VoiceError::Connection("missing transcription API key".to_string()));
        }
        if config.encoding != "linear16" {
            return Err(VoiceError::Connection(format!(
                "segments upload as PCM16 WAV, cannot send {}",
                config.encoding
            )));
        }
        // "en-US" -> "en"
        self.language = config
            .language
            .split('-')
            .next()
            .filter(|l| !l.is_empty())
            .map(str::to_lowercase);
        self.sample_rate = config.sample_rate;
        self.buffer.clear();
        let _ = events.send(TranscriptionEvent::Ready);
        self.events = Some(events);
        info!("✅ Transcription session ready ({})", self.model);
        Ok(())
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        self.buffer.clear();
        if let Some(events) = self.events.take() {
            let _ = events.send(TranscriptionEvent::Closed);
            info!("🛑 Transcription session closed");
        }
        Ok(())
    }

    fn send_audio(&mut self, frame: &AudioFrame) {
        if self.events.is_some() {
            self.buffer.extend_from_slice(&frame.samples);
        }
    }

    fn end_segment(&mut self) {
        let Some(events) = self.events.clone() else {
            return;
        };
        let samples = std::mem::take(&mut self.buffer);
        if samples.is_empty() {
            return;
        }
        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                let _ = events.send(TranscriptionEvent::Error(e.to_string()));
                return;
            }
        };

        let wav = match encode_wav(&samples, self.sample_rate) {
            Ok(wav) => wav,
            Err(e) => {
                let _ = events.send(TranscriptionEvent::Error(e.to_string()));
                return;
            }
        };
        debug!("Uploading {} samples for transcription", samples.len());
        let upload = transcribe(
            self.client.clone(),
            endpoint(&self.base_url, "audio/transcriptions"),
            self.api_key.clone(),
            self.model.clone(),
            self.language.clone(),
            wav,
        );
        handle.spawn(async move {
            let event = match upload.await {
                Ok(text) if text.is_empty() => return,
                Ok(text) => TranscriptionEvent::Transcript(text),
                Err(e) => {
                    warn!("Transcription failed: {}", e);
                    TranscriptionEvent::Error(e.to_string())
                }
            };
            let _ = events.send(event);
        });
    }

    fn is_ready(&self) -> bool {
        self.events.is_some()
    }
}
