//! Language-model capability, reply fragments and tool calls
//!
//! A model reply is a lazy stream of [`ResponseFragment`]s: content deltas
//! interleaved with complete tool calls. Providers that stream tool-call
//! arguments in pieces buffer them with a [`ToolCallAccumulator`] and only
//! yield the call once its arguments are complete.

use crate::context::Message;
use crate::error::{VoiceError, VoiceResult};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A caller-declared function the model may invoke. Passed through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the arguments object.
    pub parameters: serde_json::Value,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        parameters: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
        }
    }
}

/// A model-initiated tool invocation with its raw JSON arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider call id, when the provider assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    pub arguments_json: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments_json: impl Into<String>) -> Self {
        Self {
            id: None,
            name: name.into(),
            arguments_json: arguments_json.into(),
        }
    }

    /// Parse the arguments. Blank arguments count as an empty object.
    pub fn parse_arguments(&self) -> Result<serde_json::Value, serde_json::Error> {
        if self.arguments_json.trim().is_empty() {
            return Ok(serde_json::Value::Object(serde_json::Map::new()));
        }
        serde_json::from_str(&self.arguments_json)
    }
}

/// One piece of a streamed reply. Exactly one variant per fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseFragment {
    Content(String),
    FunctionCall(ToolCall),
}

impl ResponseFragment {
    pub fn content(text: impl Into<String>) -> Self {
        ResponseFragment::Content(text.into())
    }

    pub fn function_call(name: impl Into<String>, arguments_json: impl Into<String>) -> Self {
        ResponseFragment::FunctionCall(ToolCall::new(name, arguments_json))
    }
}

/// Lazy sequence of reply fragments. An `Err` item ends the reply.
pub type FragmentStream = BoxStream<'static, VoiceResult<ResponseFragment>>;

fn default_system_prompt() -> String {
    "You are a helpful assistant engaging in real-time conversation. Keep responses concise and natural."
        .to_string()
}

/// Generation settings shared by model adapters and the context window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    pub model: String,
    pub max_tokens: u32,
    pub system_prompt: String,
    /// Number of recent messages sent with each turn.
    pub history_window: usize,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            model: "gpt-3.5-turbo".to_string(),
            max_tokens: 100,
            system_prompt: default_system_prompt(),
            history_window: 10,
        }
    }
}

/// Everything a model needs for one reply.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Typed conversation window, oldest first.
    pub messages: Vec<Message>,
    pub tools: Vec<ToolSpec>,
    pub cancel: CancellationToken,
}

/// Language-model capability.
pub trait LanguageModel: Send + Sync {
    /// Start a reply. Errors surface as stream items
    /// ([`VoiceError::Generation`]); the stream should end once
    /// `request.cancel` fires.
    fn process_text(&self, request: GenerationRequest) -> FragmentStream;
}

#[derive(Debug, Default)]
struct PartialCall {
    id: Option<String>,
    name: String,
    arguments: String,
}

/// Buffers streamed tool-call pieces per in-flight call until the stream finishes.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<usize, PartialCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one delta for the call at stream position `index`.
    pub fn push_delta(
        &mut self,
        index: usize,
        id: Option<&str>,
        name: Option<&str>,
        arguments: Option<&str>,
    ) {
        let call = self.calls.entry(index).or_default();
        if let Some(id) = id {
            call.id = Some(id.to_string());
        }
        if let Some(name) = name {
            call.name.push_str(name);
        }
        if let Some(arguments) = arguments {
            call.arguments.push_str(arguments);
        }
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    /// Drain the buffered calls in stream order. Calls that never got a name are dropped.
    pub fn finish(&mut self) -> Vec<ToolCall> {
        std::mem::take(&mut self.calls)
            .into_values()
            .filter_map(|call| {
                if call.name.is_empty() {
                    warn!(raw = %call.arguments, "Dropping tool call without a name");
                    return None;
                }
                Some(ToolCall {
                    id: call.id,
                    name: call.name,
                    arguments_json: call.arguments,
                })
            })
            .collect()
    }
}

/// Local handler for a tool, called with the parsed arguments object.
pub type ToolHandler = Arc<dyn Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync>;

/// Declared tools plus the local handlers that run when the model calls them.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    specs: Vec<ToolSpec>,
    handlers: HashMap<String, ToolHandler>,
}

impl std::fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("specs", &self.specs)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a tool and its handler.
    pub fn register<F>(&mut self, spec: ToolSpec, handler: F) -> &mut Self
    where
        F: Fn(serde_json::Value) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.insert(spec.name.clone(), Arc::new(handler));
        self.specs.retain(|s| s.name != spec.name);
        self.specs.push(spec);
        self
    }

    /// Declare a tool with no local handler (the caller reacts to the tool-call event instead).
    pub fn declare(&mut self, spec: ToolSpec) -> &mut Self {
        self.specs.retain(|s| s.name != spec.name);
        self.specs.push(spec);
        self
    }

    pub fn specs(&self) -> &[ToolSpec] {
        &self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    /// Run the handler for `call`. `Ok(false)` when no handler is registered.
    pub fn dispatch(&self, call: &ToolCall) -> VoiceResult<bool> {
        let Some(handler) = self.handlers.get(&call.name) else {
            debug!(tool = %call.name, "No handler registered");
            return Ok(false);
        };

        let args = call.parse_arguments().map_err(|e| VoiceError::Handler {
            tool: call.name.clone(),
            reason: format!("arguments are not valid JSON: {}", e),
        })?;

        match catch_unwind(AssertUnwindSafe(|| handler(args))) {
            Ok(Ok(())) => {
                info!(tool = %call.name, "🔧 Tool handler invoked");
                Ok(true)
            }
            Ok(Err(e)) => Err(VoiceError::Handler {
                tool: call.name.clone(),
                reason: e.to_string(),
            }),
            Err(_) => Err(VoiceError::Handler {
                tool: call.name.clone(),
                reason: "handler panicked".to_string(),
            }),
        }
    }

    /// Dispatch and log any failure. Never propagates.
    pub fn invoke(&self, call: &ToolCall) -> bool {
        match self.dispatch(call) {
            Ok(invoked) => invoked,
            Err(e) => {
                warn!("{}", e);
                false
            }
        }
    }
}
