//! The dialogue loop: capture → VAD → transcription → model → synthesis.
//!
//! ```text
//! Idle ──start──▶ Listening ──transcript──▶ Processing ──reply──▶ Speaking
//!   ▲                 ▲                          │                    │
//!   │                 └──── no reply / error ────┘                    │
//!   │                 └───────────── audio ready ─────────────────────┘
//!   └────────────────────────── stop (from any state) ──────────────────
//! ```
//!
//! Everything runs on one task. Capture frames keep flowing through the VAD
//! while a turn is in flight, so barge-in is detected during generation and
//! synthesis. Transcripts that arrive mid-turn are dropped.

use crate::audio::{AudioFrame, AudioSource, CaptureEvent, SpeechSegment};
use crate::context::{ContextManager, Message, Role};
use crate::error::{ErrorKind, VoiceError, VoiceResult};
use crate::llm::{GenerationRequest, LanguageModel, ResponseFragment, ToolCall, ToolRegistry};
use crate::stt::{Transcriber, TranscriptionConfig, TranscriptionEvent};
use crate::tts::SpeechSynthesizer;
use crate::vad::{EnergyClassifier, FrameClassifier, VadConfig, VadEvent, VoiceActivityDetector};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipelineState {
    Idle,
    Listening,
    Processing,
    Speaking,
}

impl PipelineState {
    /// Whether `self → next` is a legal edge.
    pub fn can_transition_to(self, next: PipelineState) -> bool {
        use PipelineState::*;
        matches!(
            (self, next),
            (Idle, Listening)
                | (Listening, Processing)
                | (Processing, Speaking)
                | (Processing, Listening)
                | (Speaking, Listening)
                | (_, Idle)
        )
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::Listening => "listening",
            PipelineState::Processing => "processing",
            PipelineState::Speaking => "speaking",
        };
        f.write_str(name)
    }
}

/// Where user turns come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Microphone, VAD and transcription.
    #[default]
    Voice,
    /// Typed input through [`Pipeline::send_text`]. No audio is captured.
    Text,
}

/// Pipeline settings. Fixed for the pipeline's lifetime.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub mode: InputMode,
    pub vad: VadConfig,
    pub transcription: TranscriptionConfig,
}

/// Observable pipeline events, delivered in order on one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    StateChanged {
        from: PipelineState,
        to: PipelineState,
    },
    SpeechStarted,
    SpeechEnded {
        duration: Duration,
    },
    VadMisfire,
    /// The user spoke over synthesized audio.
    Interrupted,
    /// A user turn was accepted.
    Transcript(String),
    /// A content delta of the reply.
    Response(String),
    ToolCall(ToolCall),
    /// Synthesized audio for the completed reply.
    AudioReady(Vec<u8>),
    Error {
        kind: ErrorKind,
        message: String,
    },
}

/// How a user turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnOutcome {
    /// The reply was generated and synthesized.
    Replied(String),
    /// The model only called tools.
    ToolCallsOnly,
    /// The model produced nothing.
    NoReply,
    /// Generation or synthesis failed; the pipeline is listening again.
    Failed,
    /// The session was stopped mid-turn.
    Cancelled,
}

/// The capabilities a pipeline drives.
pub struct Capabilities {
    pub model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub transcriber: Option<Box<dyn Transcriber>>,
    pub audio: Option<Box<dyn AudioSource>>,
    pub classifier: Option<Box<dyn FrameClassifier>>,
    pub context: Option<ContextManager>,
    pub tools: ToolRegistry,
}

impl Capabilities {
    /// Text-only capabilities. Voice mode also needs a transcriber and an audio source.
    pub fn new(model: Arc<dyn LanguageModel>, synthesizer: Arc<dyn SpeechSynthesizer>) -> Self {
        Self {
            model,
            synthesizer,
            transcriber: None,
            audio: None,
            classifier: None,
            context: None,
            tools: ToolRegistry::new(),
        }
    }

    pub fn with_transcriber(mut self, transcriber: impl Transcriber + 'static) -> Self {
        self.transcriber = Some(Box::new(transcriber));
        self
    }

    pub fn with_audio_source(mut self, source: impl AudioSource + 'static) -> Self {
        self.audio = Some(Box::new(source));
        self
    }

    /// Replace the default energy classifier.
    pub fn with_classifier(mut self, classifier: impl FrameClassifier + 'static) -> Self {
        self.classifier = Some(Box::new(classifier));
        self
    }

    /// Keep conversation history. Without a context each turn is sent alone.
    pub fn with_context(mut self, context: ContextManager) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = tools;
        self
    }
}

enum Control {
    SetAudioPlaying(bool),
    Stop,
}

/// Cloneable handle for controlling a pipeline that is busy in
/// [`Pipeline::run`] or [`Pipeline::send_text`].
#[derive(Clone)]
pub struct PipelineHandle {
    control: mpsc::UnboundedSender<Control>,
}

impl PipelineHandle {
    /// Cancel in-flight work and stop the session.
    pub fn stop(&self) {
        let _ = self.control.send(Control::Stop);
    }

    /// Report whether synthesized audio is audible (enables barge-in).
    pub fn set_audio_playing_state(&self, playing: bool) {
        let _ = self.control.send(Control::SetAudioPlaying(playing));
    }
}

/// Owns the lifecycle state and the outgoing event channel.
struct StateMachine {
    state: PipelineState,
    events: mpsc::UnboundedSender<PipelineEvent>,
}

impl StateMachine {
    fn transition(&mut self, to: PipelineState) -> VoiceResult<()> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(VoiceError::InvalidState(format!(
                "cannot move from {} to {}",
                from, to
            )));
        }
        if from == to {
            return Ok(());
        }
        self.state = to;
        debug!("State {} → {}", from, to);
        self.emit(PipelineEvent::StateChanged { from, to });
        Ok(())
    }

    fn emit(&self, event: PipelineEvent) {
        if self.events.send(event).is_err() {
            debug!("Pipeline event receiver dropped");
        }
    }

    fn report(&self, err: &VoiceError) {
        error!("Pipeline error: {}", err);
        self.emit(PipelineEvent::Error {
            kind: err.kind(),
            message: err.to_string(),
        });
    }
}

/// Input side: segmentation and transcription.
struct Listener {
    vad: VoiceActivityDetector,
    vad_events: mpsc::UnboundedReceiver<VadEvent>,
    transcriber: Option<Box<dyn Transcriber>>,
    audio: Option<Box<dyn AudioSource>>,
}

impl Listener {
    fn forward_segment(&mut self, segment: SpeechSegment) {
        let Some(transcriber) = self.transcriber.as_mut() else {
            return;
        };
        let mut dropped = 0usize;
        for frame in segment.frames() {
            if transcriber.is_ready() {
                transcriber.send_audio(frame);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            warn!("Transcriber not ready, dropped {} frames", dropped);
        }
        if transcriber.is_ready() {
            transcriber.end_segment();
        }
    }
}

/// Output side: the model, synthesis and history.
struct Responder {
    model: Arc<dyn LanguageModel>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    context: Option<ContextManager>,
    tools: ToolRegistry,
}

/// Resources that live from `start` to `stop`.
struct Session {
    mode: InputMode,
    cancel: CancellationToken,
    capture: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    transcripts: Option<mpsc::UnboundedReceiver<TranscriptionEvent>>,
}

enum Halt {
    Cancelled,
    Fatal(VoiceError),
}

/// Real-time spoken-dialogue pipeline.
///
/// Not `Send`: drive it from a single task (e.g. `#[tokio::main(flavor =
/// "current_thread")]` or a `LocalSet`) and control it through a
/// [`PipelineHandle`].
pub struct Pipeline {
    config: PipelineConfig,
    machine: StateMachine,
    listener: Listener,
    responder: Responder,
    session: Option<Session>,
    control_tx: mpsc::UnboundedSender<Control>,
    control_rx: mpsc::UnboundedReceiver<Control>,
}

impl Pipeline {
    /// Build a pipeline. Returns the event receiver alongside it.
    pub fn new(
        config: PipelineConfig,
        capabilities: Capabilities,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<PipelineEvent>)> {
        let Capabilities {
            model,
            synthesizer,
            transcriber,
            audio,
            classifier,
            mut context,
            tools,
        } = capabilities;

        let classifier = classifier.unwrap_or_else(|| {
            Box::new(EnergyClassifier::new(config.vad.energy_threshold)) as Box<dyn FrameClassifier>
        });
        let (vad, vad_events) = VoiceActivityDetector::new(config.vad.clone(), classifier)?;

        if let Some(ctx) = context.as_mut() {
            if !ctx.has_model() {
                ctx.set_model(Arc::clone(&model));
            }
            if ctx.tools().is_empty() && !tools.is_empty() {
                ctx.set_tools(tools.clone());
            }
        }

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        info!("🎭 Pipeline created ({:?} mode)", config.mode);

        let pipeline = Self {
            config,
            machine: StateMachine {
                state: PipelineState::Idle,
                events: events_tx,
            },
            listener: Listener {
                vad,
                vad_events,
                transcriber,
                audio,
            },
            responder: Responder {
                model,
                synthesizer,
                context,
                tools,
            },
            session: None,
            control_tx,
            control_rx,
        };
        Ok((pipeline, events_rx))
    }

    pub fn state(&self) -> PipelineState {
        self.machine.state
    }

    pub fn is_active(&self) -> bool {
        self.session.is_some()
    }

    pub fn mode(&self) -> InputMode {
        self.config.mode
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn handle(&self) -> PipelineHandle {
        PipelineHandle {
            control: self.control_tx.clone(),
        }
    }

    pub fn context(&self) -> Option<&ContextManager> {
        self.responder.context.as_ref()
    }

    pub fn context_mut(&mut self) -> Option<&mut ContextManager> {
        self.responder.context.as_mut()
    }

    /// Acquire audio, open transcription and start listening.
    ///
    /// Text mode skips audio and transcription. On failure the pipeline
    /// stays idle and everything acquired so far is released.
    pub async fn start(&mut self) -> VoiceResult<()> {
        if self.session.is_some() {
            return Err(VoiceError::InvalidState(
                "Pipeline is already active".to_string(),
            ));
        }
        info!("🚀 Starting pipeline ({:?} mode)", self.config.mode);

        // Stale requests from a previous session
        while self.control_rx.try_recv().is_ok() {}

        let session = match self.config.mode {
            InputMode::Text => Session {
                mode: InputMode::Text,
                cancel: CancellationToken::new(),
                capture: None,
                transcripts: None,
            },
            InputMode::Voice => match self.open_voice_session().await {
                Ok(session) => session,
                Err(e) => {
                    self.machine.report(&e);
                    return Err(e);
                }
            },
        };

        self.session = Some(session);
        self.machine.transition(PipelineState::Listening)?;
        info!("✅ Pipeline started");
        Ok(())
    }

    async fn open_voice_session(&mut self) -> VoiceResult<Session> {
        let listener = &mut self.listener;
        let audio = listener
            .audio
            .as_mut()
            .ok_or_else(|| VoiceError::Acquisition("no audio source configured".to_string()))?;
        let transcriber = listener
            .transcriber
            .as_mut()
            .ok_or_else(|| VoiceError::Connection("no transcriber configured".to_string()))?;

        let capture = audio.open()?;

        let (transcript_tx, transcripts) = mpsc::unbounded_channel();
        if let Err(e) = transcriber.start(&self.config.transcription, transcript_tx).await {
            audio.close();
            return Err(match e {
                VoiceError::Connection(_) => e,
                other => VoiceError::Connection(other.to_string()),
            });
        }

        if let Err(e) = listener.vad.start() {
            audio.close();
            let _ = transcriber.stop().await;
            return Err(e);
        }
        // Leftovers from a previous session
        while listener.vad_events.try_recv().is_ok() {}

        Ok(Session {
            mode: InputMode::Voice,
            cancel: CancellationToken::new(),
            capture: Some(capture),
            transcripts: Some(transcripts),
        })
    }

    /// Cancel in-flight work, release audio and transcription, go idle.
    ///
    /// Safe to call when already idle.
    pub async fn stop(&mut self) -> VoiceResult<()> {
        let Some(session) = self.session.take() else {
            return Ok(());
        };
        info!("🛑 Stopping pipeline");
        session.cancel.cancel();

        let mut result = Ok(());
        if session.mode == InputMode::Voice {
            self.listener.vad.stop();
            if let Some(audio) = self.listener.audio.as_mut() {
                audio.close();
            }
            if let Some(transcriber) = self.listener.transcriber.as_mut() {
                result = transcriber.stop().await;
            }
        }
        drop(session);

        self.machine.transition(PipelineState::Idle)?;
        if let Err(e) = &result {
            self.machine.report(e);
        }
        info!("✅ Pipeline stopped");
        result
    }

    /// Drive a voice session until it is stopped.
    ///
    /// Returns `Ok` after a requested stop, or the error that ended the
    /// session (a capture failure stops the pipeline first).
    pub async fn run(&mut self) -> VoiceResult<()> {
        match self.session.as_ref() {
            None => {
                return Err(VoiceError::InvalidState(
                    "Pipeline is not active".to_string(),
                ))
            }
            Some(s) if s.mode != InputMode::Voice => {
                return Err(VoiceError::InvalidState(
                    "run() drives voice mode, use send_text() in text mode".to_string(),
                ))
            }
            Some(_) => {}
        }
        info!("🔄 Pipeline loop started");

        loop {
            let Some(session) = self.session.as_mut() else {
                return Ok(());
            };
            let step = tokio::select! {
                biased;
                _ = session.cancel.cancelled() => Step::Stop,
                Some(ctl) = self.control_rx.recv() => Step::Control(ctl),
                event = recv_or_pending(&mut session.capture) => match event {
                    Some(event) => Step::Capture(event),
                    None => Step::Capture(CaptureEvent::Error("capture stream ended".to_string())),
                },
                event = recv_or_pending(&mut session.transcripts) => Step::Transcription(event),
            };

            match step {
                Step::Stop => {
                    self.stop().await?;
                    return Ok(());
                }
                Step::Control(ctl) => self.apply_control(ctl),
                Step::Capture(CaptureEvent::Frame(frame)) => {
                    if let Err(e) = self.feed_frame(frame) {
                        self.machine.report(&e);
                    }
                }
                Step::Capture(CaptureEvent::Error(reason)) => {
                    let err = VoiceError::Acquisition(reason);
                    self.machine.report(&err);
                    self.stop().await?;
                    return Err(err);
                }
                Step::Transcription(Some(event)) => {
                    if let Err(e) = self.handle_transcription_event(event).await {
                        warn!("Turn ended the session: {}", e);
                        return Err(e);
                    }
                }
                Step::Transcription(None) => {
                    warn!("Transcription channel closed");
                    if let Some(session) = self.session.as_mut() {
                        session.transcripts = None;
                    }
                }
            }
        }
    }

    /// Push one capture frame through the VAD and act on what it reports.
    ///
    /// Finished segments are forwarded to the transcriber. Frames fed
    /// while idle are ignored.
    pub fn feed_frame(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        process_frame(&self.machine, &mut self.listener, frame)
    }

    /// Report whether synthesized audio is audible (enables barge-in).
    pub fn set_audio_playing_state(&mut self, playing: bool) {
        self.listener.vad.set_audio_playing_state(playing);
    }

    /// React to a transcription event. A final transcript starts a turn
    /// when the pipeline is listening; otherwise it is dropped.
    pub async fn handle_transcription_event(&mut self, event: TranscriptionEvent) -> VoiceResult<()> {
        if self.session.is_none() {
            debug!("Ignoring transcription event while idle");
            return Ok(());
        }
        match event {
            TranscriptionEvent::Ready => info!("✅ Transcription ready"),
            TranscriptionEvent::Closed => warn!("Transcription session closed"),
            TranscriptionEvent::Error(message) => {
                self.machine.report(&VoiceError::Transcription(message));
            }
            TranscriptionEvent::Transcript(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Ok(());
                }
                if self.machine.state != PipelineState::Listening {
                    warn!("Turn in flight, dropping transcript: {:?}", text);
                    return Ok(());
                }
                info!("📝 Transcript: {}", text);
                self.machine.emit(PipelineEvent::Transcript(text.to_string()));
                self.run_turn(text).await?;
            }
        }
        Ok(())
    }

    /// Submit a typed user turn and wait for it to finish.
    pub async fn send_text(&mut self, text: &str) -> VoiceResult<TurnOutcome> {
        let Some(session) = self.session.as_ref() else {
            return Err(VoiceError::InvalidState(
                "Pipeline is not active".to_string(),
            ));
        };
        if session.mode != InputMode::Text {
            return Err(VoiceError::InvalidState(
                "send_text() requires text mode".to_string(),
            ));
        }
        if self.machine.state != PipelineState::Listening {
            return Err(VoiceError::InvalidState(format!(
                "a turn is already in flight ({})",
                self.machine.state
            )));
        }
        let text = text.trim();
        if text.is_empty() {
            return Ok(TurnOutcome::NoReply);
        }
        self.machine.emit(PipelineEvent::Transcript(text.to_string()));
        self.run_turn(text).await
    }

    fn apply_control(&mut self, ctl: Control) {
        match ctl {
            Control::SetAudioPlaying(playing) => self.set_audio_playing_state(playing),
            Control::Stop => {
                if let Some(session) = self.session.as_ref() {
                    session.cancel.cancel();
                }
            }
        }
    }

    /// One user turn: generate, then synthesize.
    ///
    /// Generation and synthesis failures are reported and end the turn with
    /// the pipeline listening again. Cancellation stops the session.
    async fn run_turn(&mut self, text: &str) -> VoiceResult<TurnOutcome> {
        let (generated, reply, tool_calls) = self.generate(text).await?;

        match generated {
            Ok(()) => {}
            Err(TurnError::Halt(halt)) => return self.halt(halt).await,
            Err(TurnError::Failed(e)) => {
                self.machine.report(&e);
                self.machine.transition(PipelineState::Listening)?;
                return Ok(TurnOutcome::Failed);
            }
        }

        if reply.trim().is_empty() {
            self.machine.transition(PipelineState::Listening)?;
            return Ok(if tool_calls > 0 {
                TurnOutcome::ToolCallsOnly
            } else {
                TurnOutcome::NoReply
            });
        }

        self.machine.transition(PipelineState::Speaking)?;
        info!("🗣️ Synthesizing reply ({} chars)", reply.len());
        let synthesized = self.synthesize(&reply).await?;
        match synthesized {
            Ok(audio) => {
                if !audio.is_empty() {
                    self.machine.emit(PipelineEvent::AudioReady(audio));
                }
                self.machine.transition(PipelineState::Listening)?;
                Ok(TurnOutcome::Replied(reply))
            }
            Err(TurnError::Failed(e)) => {
                self.machine.report(&e);
                self.machine.transition(PipelineState::Listening)?;
                Ok(TurnOutcome::Failed)
            }
            Err(TurnError::Halt(halt)) => self.halt(halt).await,
        }
    }

    async fn generate(&mut self, text: &str) -> VoiceResult<(Result<(), TurnError>, String, usize)> {
        let Self {
            machine,
            listener,
            responder,
            session,
            control_rx,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Err(VoiceError::InvalidState(
                "Pipeline is not active".to_string(),
            ));
        };
        machine.transition(PipelineState::Processing)?;
        let cancel = session.cancel.clone();

        let direct = responder.context.is_none();
        let mut fragments: Pin<Box<dyn Stream<Item = VoiceResult<ResponseFragment>> + '_>> =
            match responder.context.as_mut() {
                Some(ctx) => Box::pin(ctx.process_with_context(text, None, cancel.clone())),
                None => Box::pin(responder.model.process_text(GenerationRequest {
                    messages: vec![Message::text(Role::User, text, 0)],
                    tools: responder.tools.specs().to_vec(),
                    cancel: cancel.clone(),
                })),
            };

        let mut reply = String::new();
        let mut tool_calls = 0usize;
        let mut loop_ctx = TurnLoop {
            cancel: &cancel,
            machine,
            listener,
            session,
            control_rx,
        };
        let result = loop {
            match loop_ctx.service(fragments.next()).await {
                Err(halt) => break Err(TurnError::Halt(halt)),
                Ok(None) => break Ok(()),
                Ok(Some(Err(VoiceError::Cancelled))) => break Err(TurnError::Halt(Halt::Cancelled)),
                Ok(Some(Err(e))) => break Err(TurnError::Failed(e)),
                Ok(Some(Ok(ResponseFragment::Content(delta)))) => {
                    reply.push_str(&delta);
                    loop_ctx.machine.emit(PipelineEvent::Response(delta));
                }
                Ok(Some(Ok(ResponseFragment::FunctionCall(call)))) => {
                    tool_calls += 1;
                    info!("🔧 Tool call: {}", call.name);
                    if direct {
                        responder.tools.invoke(&call);
                    }
                    loop_ctx.machine.emit(PipelineEvent::ToolCall(call));
                }
            }
        };
        Ok((result, reply, tool_calls))
    }

    async fn synthesize(&mut self, reply: &str) -> VoiceResult<Result<Vec<u8>, TurnError>> {
        let Self {
            machine,
            listener,
            responder,
            session,
            control_rx,
            ..
        } = self;
        let Some(session) = session.as_mut() else {
            return Err(VoiceError::InvalidState(
                "Pipeline is not active".to_string(),
            ));
        };
        let cancel = session.cancel.clone();
        let synthesizer = Arc::clone(&responder.synthesizer);
        let mut loop_ctx = TurnLoop {
            cancel: &cancel,
            machine,
            listener,
            session,
            control_rx,
        };
        let result = match loop_ctx.service(synthesizer.text_to_speech(reply, &cancel)).await {
            Err(halt) => Err(TurnError::Halt(halt)),
            Ok(Err(VoiceError::Cancelled)) => Err(TurnError::Halt(Halt::Cancelled)),
            Ok(Err(e)) => Err(TurnError::Failed(e)),
            Ok(Ok(audio)) => Ok(audio),
        };
        Ok(result)
    }

    async fn halt(&mut self, halt: Halt) -> VoiceResult<TurnOutcome> {
        match halt {
            Halt::Cancelled => {
                info!("Turn cancelled");
                self.stop().await?;
                Ok(TurnOutcome::Cancelled)
            }
            Halt::Fatal(err) => {
                self.machine.report(&err);
                self.stop().await?;
                Err(err)
            }
        }
    }
}

enum Step {
    Stop,
    Control(Control),
    Capture(CaptureEvent),
    Transcription(Option<TranscriptionEvent>),
}

enum TurnError {
    Halt(Halt),
    Failed(VoiceError),
}

/// Borrowed pipeline parts that keep the input side alive during a turn.
struct TurnLoop<'a> {
    cancel: &'a CancellationToken,
    machine: &'a mut StateMachine,
    listener: &'a mut Listener,
    session: &'a mut Session,
    control_rx: &'a mut mpsc::UnboundedReceiver<Control>,
}

impl TurnLoop<'_> {
    /// Await `fut` while still feeding capture frames to the VAD.
    async fn service<F: Future>(&mut self, fut: F) -> Result<F::Output, Halt> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Halt::Cancelled),
                Some(ctl) = self.control_rx.recv() => match ctl {
                    Control::SetAudioPlaying(playing) => self.listener.vad.set_audio_playing_state(playing),
                    Control::Stop => self.cancel.cancel(),
                },
                out = &mut fut => return Ok(out),
                Some(event) = recv_or_pending(&mut self.session.capture) => match event {
                    CaptureEvent::Frame(frame) => {
                        if let Err(e) = process_frame(self.machine, self.listener, frame) {
                            self.machine.report(&e);
                        }
                    }
                    CaptureEvent::Error(reason) => {
                        return Err(Halt::Fatal(VoiceError::Acquisition(reason)));
                    }
                },
                Some(event) = recv_or_pending(&mut self.session.transcripts) => match event {
                    TranscriptionEvent::Transcript(text) => {
                        warn!("Turn in flight, dropping transcript: {:?}", text);
                    }
                    TranscriptionEvent::Error(message) => {
                        self.machine.report(&VoiceError::Transcription(message));
                    }
                    TranscriptionEvent::Closed => warn!("Transcription session closed"),
                    TranscriptionEvent::Ready => {}
                },
            }
        }
    }
}

fn process_frame(machine: &StateMachine, listener: &mut Listener, frame: AudioFrame) -> VoiceResult<()> {
    listener.vad.feed(frame)?;
    while let Ok(event) = listener.vad_events.try_recv() {
        match event {
            VadEvent::Interrupt => {
                info!("⚡ User interrupted playback");
                machine.emit(PipelineEvent::Interrupted);
            }
            VadEvent::SpeechStart => machine.emit(PipelineEvent::SpeechStarted),
            VadEvent::Misfire { duration } => {
                debug!("VAD misfire ({:?})", duration);
                machine.emit(PipelineEvent::VadMisfire);
            }
            VadEvent::SpeechEnd(segment) => {
                machine.emit(PipelineEvent::SpeechEnded {
                    duration: segment.duration(),
                });
                listener.forward_segment(segment);
            }
        }
    }
    Ok(())
}

async fn recv_or_pending<T>(rx: &mut Option<mpsc::UnboundedReceiver<T>>) -> Option<T> {
    match rx {
        Some(rx) => rx.recv().await,
        None => futures::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn legal_transitions() {
        use PipelineState::*;
        assert!(Idle.can_transition_to(Listening));
        assert!(Listening.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Speaking));
        assert!(Processing.can_transition_to(Listening));
        assert!(Speaking.can_transition_to(Listening));
        for s in [Idle, Listening, Processing, Speaking] {
            assert!(s.can_transition_to(Idle));
        }
    }

    #[test]
    fn illegal_transitions() {
        use PipelineState::*;
        assert!(!Idle.can_transition_to(Processing));
        assert!(!Idle.can_transition_to(Speaking));
        assert!(!Listening.can_transition_to(Speaking));
        assert!(!Speaking.can_transition_to(Processing));
    }

    #[test]
    fn state_machine_emits_on_change_only() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut machine = StateMachine {
            state: PipelineState::Idle,
            events: tx,
        };
        machine.transition(PipelineState::Listening).unwrap();
        assert!(machine.transition(PipelineState::Speaking).is_err());
        assert_eq!(machine.state, PipelineState::Listening);
        assert_eq!(
            rx.try_recv().unwrap(),
            PipelineEvent::StateChanged {
                from: PipelineState::Idle,
                to: PipelineState::Listening
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn config_parses_mode() {
        let c: PipelineConfig = toml::from_str("mode = \"text\"").unwrap();
        assert_eq!(c.mode, InputMode::Text);
        assert_eq!(c.vad, VadConfig::default());
    }
}
