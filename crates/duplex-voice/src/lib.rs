//! # Duplex Voice - Real-Time Spoken Dialogue
//!
//! A full-duplex conversation loop: microphone frames are segmented by voice
//! activity detection, transcribed, answered by a streaming language model
//! (with tool calls), and spoken back. The user can barge in over playback.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                            Pipeline                              │
//! │  ┌────────────┐  ┌────────────┐  ┌─────────────┐                 │
//! │  │ AudioSource│→ │    VAD     │→ │ Transcriber │                 │
//! │  │   (cpal)   │  │ (segments) │  │ (segments)  │                 │
//! │  └────────────┘  └────────────┘  └─────────────┘                 │
//! │                        │ Interrupt        ↓ transcript           │
//! │                        ↓          ┌───────────────┐              │
//! │  ┌────────────┐   events out      │ContextManager │→ LanguageModel│
//! │  │VoiceOutput │←── AudioReady ────│ (history,     │  (fragments, │
//! │  │  (rodio)   │                   │  tool calls)  │   tools)     │
//! │  └────────────┘                   └───────────────┘              │
//! │                                        ↓ reply                   │
//! │                                   SpeechSynthesizer              │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Providers for the capability traits live in [`providers`]; any other
//! backend plugs in by implementing [`Transcriber`], [`LanguageModel`] or
//! [`SpeechSynthesizer`].

pub mod audio;
pub mod config;
pub mod context;
pub mod error;
pub mod llm;
pub mod pipeline;
pub mod providers;
pub mod stt;
pub mod tts;
pub mod vad;
#[cfg(feature = "device")]
pub mod voice_output;

pub use audio::{encode_wav, AudioConfig, AudioFrame, AudioSource, CaptureEvent, ChannelSource, FrameSender, SpeechSegment};
#[cfg(feature = "device")]
pub use audio::MicrophoneSource;
pub use config::VoiceConfig;
pub use context::{Context, ContextManager, Message, Role};
pub use error::{ErrorKind, VoiceError, VoiceResult};
pub use llm::{
    FragmentStream, GenerationConfig, GenerationRequest, LanguageModel, ResponseFragment,
    ToolCall, ToolCallAccumulator, ToolHandler, ToolRegistry, ToolSpec,
};
pub use pipeline::{
    Capabilities, InputMode, Pipeline, PipelineConfig, PipelineEvent, PipelineHandle,
    PipelineState, TurnOutcome,
};
pub use stt::{Transcriber, TranscriptionConfig, TranscriptionEvent};
pub use tts::{OutputFormat, SpeechSynthesizer, SynthesisConfig};
pub use vad::{EnergyClassifier, FrameClassifier, VadConfig, VadEvent, VoiceActivityDetector};
#[cfg(feature = "webrtc")]
pub use vad::WebRtcClassifier;
#[cfg(feature = "device")]
pub use voice_output::VoiceOutput;
