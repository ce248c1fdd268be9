//! Conversation context: append-only message log and reply generation.
//!
//! The manager owns the log exclusively. Tool calls are persisted as their
//! own messages the moment they arrive; reply text is persisted once, as a
//! single assistant message, after the model stream completes.

use crate::error::{VoiceError, VoiceResult};
use crate::llm::{GenerationRequest, LanguageModel, ResponseFragment, ToolCall, ToolRegistry, ToolSpec};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// One entry of the conversation log. Either text or a tool call, never both.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    /// Monotonic milliseconds since the owning manager was created.
    pub timestamp_ms: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call: Option<ToolCall>,
}

impl Message {
    pub fn text(role: Role, content: impl Into<String>, timestamp_ms: u64) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp_ms,
            created_at: Utc::now(),
            tool_call: None,
        }
    }

    pub fn tool_call(call: ToolCall, timestamp_ms: u64) -> Self {
        Self {
            role: Role::Assistant,
            content: String::new(),
            timestamp_ms,
            created_at: Utc::now(),
            tool_call: Some(call),
        }
    }

    pub fn is_tool_call(&self) -> bool {
        self.tool_call.is_some()
    }
}

/// Ordered messages plus free-form metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Context {
    pub messages: Vec<Message>,
    pub metadata: HashMap<String, serde_json::Value>,
}

/// Owns the conversation log and drives replies through the language model.
pub struct ContextManager {
    context: Context,
    origin: Instant,
    last_timestamp_ms: u64,
    window: usize,
    system_prompt: Option<String>,
    model: Option<Arc<dyn LanguageModel>>,
    tools: ToolRegistry,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new(Context::default())
    }
}

impl ContextManager {
    /// Start from an existing context (e.g. a restored conversation).
    pub fn new(initial: Context) -> Self {
        let last_timestamp_ms = initial
            .messages
            .iter()
            .map(|m| m.timestamp_ms)
            .max()
            .unwrap_or(0);
        Self {
            context: initial,
            origin: Instant::now(),
            last_timestamp_ms,
            window: 10,
            system_prompt: None,
            model: None,
            tools: ToolRegistry::new(),
        }
    }

    /// Pin a system message ahead of every window sent to the model.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }

    /// Number of recent messages sent with each reply (default 10).
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window.max(1);
        self
    }

    pub fn set_model(&mut self, model: Arc<dyn LanguageModel>) {
        self.model = Some(model);
    }

    pub fn has_model(&self) -> bool {
        self.model.is_some()
    }

    pub fn set_tools(&mut self, tools: ToolRegistry) {
        self.tools = tools;
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Append a message. A tool call must come with empty content.
    pub fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        tool_call: Option<ToolCall>,
    ) -> VoiceResult<Message> {
        let content = content.into();
        let timestamp_ms = self.next_timestamp();
        let message = match tool_call {
            Some(call) if content.is_empty() => {
                let mut message = Message::tool_call(call, timestamp_ms);
                message.role = role;
                message
            }
            Some(call) => {
                return Err(VoiceError::InvalidState(format!(
                    "tool call '{}' cannot carry text content",
                    call.name
                )))
            }
            None => Message::text(role, content, timestamp_ms),
        };
        debug!(role = message.role.as_str(), tool = message.is_tool_call(), "📝 Added message");
        self.context.messages.push(message.clone());
        Ok(message)
    }

    /// The last `n` messages in original order.
    pub fn get_recent(&self, n: usize) -> &[Message] {
        let messages = &self.context.messages;
        &messages[messages.len().saturating_sub(n)..]
    }

    pub fn get_context(&self) -> &Context {
        &self.context
    }

    pub fn messages(&self) -> &[Message] {
        &self.context.messages
    }

    pub fn len(&self) -> usize {
        self.context.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.context.messages.is_empty()
    }

    pub fn set_metadata(&mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) {
        self.context.metadata.insert(key.into(), value.into());
    }

    pub fn get_metadata(&self, key: &str) -> Option<&serde_json::Value> {
        self.context.metadata.get(key)
    }

    pub fn clear(&mut self) {
        info!("Context cleared");
        self.context.messages.clear();
        self.context.metadata.clear();
    }

    /// Record `user_text`, then stream the model's reply.
    ///
    /// Tool calls are persisted (and their handlers run) before they are
    /// yielded. Content is accumulated and persisted as one assistant message
    /// when the stream completes; a failed or cancelled stream persists no text.
    /// `tools` overrides the registry's declared tools for this reply.
    pub fn process_with_context<'a>(
        &'a mut self,
        user_text: &str,
        tools: Option<Vec<ToolSpec>>,
        cancel: CancellationToken,
    ) -> impl Stream<Item = VoiceResult<ResponseFragment>> + 'a {
        let user_text = user_text.to_string();
        async_stream::try_stream! {
            let model = self
                .model
                .clone()
                .ok_or_else(|| VoiceError::Generation("language model not set".to_string()))?;

            self.add_message(Role::User, user_text, None)?;
            let request = GenerationRequest {
                messages: self.window_messages(),
                tools: tools.unwrap_or_else(|| self.tools.specs().to_vec()),
                cancel: cancel.clone(),
            };
            debug!(messages = request.messages.len(), tools = request.tools.len(), "Processing with context");

            let mut fragments = model.process_text(request);
            let mut reply = String::new();
            while let Some(fragment) = fragments.next().await {
                let fragment = fragment?;
                match &fragment {
                    ResponseFragment::FunctionCall(call) => {
                        self.add_message(Role::Assistant, "", Some(call.clone()))?;
                        self.tools.invoke(call);
                    }
                    ResponseFragment::Content(text) => reply.push_str(text),
                }
                yield fragment;
            }

            if cancel.is_cancelled() {
                Err::<(), _>(VoiceError::Cancelled)?;
            }
            if !reply.is_empty() {
                self.add_message(Role::Assistant, reply, None)?;
            }
        }
    }

    fn window_messages(&self) -> Vec<Message> {
        let mut window = Vec::with_capacity(self.window + 1);
        if let Some(prompt) = &self.system_prompt {
            window.push(Message::text(Role::System, prompt.clone(), 0));
        }
        window.extend_from_slice(self.get_recent(self.window));
        window
    }

    fn next_timestamp(&mut self) -> u64 {
        let elapsed = self.origin.elapsed().as_millis() as u64;
        self.last_timestamp_ms = elapsed.max(self.last_timestamp_ms + 1);
        self.last_timestamp_ms
    }
}
