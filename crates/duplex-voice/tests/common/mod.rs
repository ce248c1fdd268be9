//! Scripted capabilities for driving the pipeline without network or devices.

#![allow(dead_code)]

use async_trait::async_trait;
use duplex_voice::{
    AudioFrame, AudioSource, CaptureEvent, FragmentStream, GenerationRequest, LanguageModel,
    PipelineEvent, ResponseFragment, SpeechSynthesizer, Transcriber, TranscriptionConfig,
    TranscriptionEvent, VoiceError, VoiceResult,
};
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const FRAME: usize = 320; // 20ms at 16kHz

pub fn voice() -> AudioFrame {
    AudioFrame::new(vec![8000; FRAME], 16000)
}

pub fn silence() -> AudioFrame {
    AudioFrame::new(vec![0; FRAME], 16000)
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Receive events until `done` matches one, returning everything seen.
pub async fn wait_for(
    events: &mut mpsc::UnboundedReceiver<PipelineEvent>,
    done: impl Fn(&PipelineEvent) -> bool,
) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    let collect = async {
        while let Some(event) = events.recv().await {
            let finished = done(&event);
            seen.push(event);
            if finished {
                return;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), collect)
        .await
        .expect("timed out waiting for pipeline event");
    seen
}

pub fn drain(events: &mut mpsc::UnboundedReceiver<PipelineEvent>) -> Vec<PipelineEvent> {
    let mut seen = Vec::new();
    while let Ok(event) = events.try_recv() {
        seen.push(event);
    }
    seen
}

// -----------------------------------------------------------------------------
// Language model
// -----------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Step {
    Say(&'static str),
    Call(&'static str, &'static str),
    Fail(&'static str),
    /// Never finishes; only cancellation ends the turn.
    Stall,
}

/// Plays one script per call, in order. Extra calls get an empty reply.
pub struct ScriptedModel {
    scripts: Mutex<VecDeque<Vec<Step>>>,
    requests: Arc<Mutex<Vec<GenerationRequest>>>,
}

impl ScriptedModel {
    pub fn new(scripts: Vec<Vec<Step>>) -> (Arc<Self>, Arc<Mutex<Vec<GenerationRequest>>>) {
        let requests = Arc::new(Mutex::new(Vec::new()));
        let model = Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
            requests: Arc::clone(&requests),
        });
        (model, requests)
    }
}

impl LanguageModel for ScriptedModel {
    fn process_text(&self, request: GenerationRequest) -> FragmentStream {
        self.requests.lock().unwrap().push(request);
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();

        let mut items = Vec::new();
        let mut stall = false;
        for step in script {
            match step {
                Step::Say(text) => items.push(Ok(ResponseFragment::content(text))),
                Step::Call(name, args) => items.push(Ok(ResponseFragment::function_call(name, args))),
                Step::Fail(reason) => items.push(Err(VoiceError::Generation(reason.to_string()))),
                Step::Stall => stall = true,
            }
        }
        let head = stream::iter(items);
        if stall {
            head.chain(stream::pending()).boxed()
        } else {
            head.boxed()
        }
    }
}

// -----------------------------------------------------------------------------
// Synthesizer
// -----------------------------------------------------------------------------

pub struct RecordingSynthesizer {
    spoken: Arc<Mutex<Vec<String>>>,
    fail: bool,
}

impl RecordingSynthesizer {
    pub fn new() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        Self::build(false)
    }

    pub fn failing() -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        Self::build(true)
    }

    fn build(fail: bool) -> (Arc<Self>, Arc<Mutex<Vec<String>>>) {
        let spoken = Arc::new(Mutex::new(Vec::new()));
        let synth = Arc::new(Self {
            spoken: Arc::clone(&spoken),
            fail,
        });
        (synth, spoken)
    }
}

#[async_trait]
impl SpeechSynthesizer for RecordingSynthesizer {
    async fn text_to_speech(&self, text: &str, _cancel: &CancellationToken) -> VoiceResult<Vec<u8>> {
        self.spoken.lock().unwrap().push(text.to_string());
        if self.fail {
            return Err(VoiceError::Synthesis("voice unavailable".to_string()));
        }
        Ok(b"RIFF-fake-wav".to_vec())
    }
}

// -----------------------------------------------------------------------------
// Transcriber
// -----------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct TranscriberLog {
    pub started: usize,
    pub stopped: usize,
    pub frames: usize,
    pub segments: usize,
}

/// Answers every finished segment with the same transcript.
pub struct RecordingTranscriber {
    transcript: String,
    fail_start: bool,
    events: Option<mpsc::UnboundedSender<TranscriptionEvent>>,
    log: Arc<Mutex<TranscriberLog>>,
}

impl RecordingTranscriber {
    pub fn new(transcript: &str) -> (Self, Arc<Mutex<TranscriberLog>>) {
        let log = Arc::new(Mutex::new(TranscriberLog::default()));
        let stt = Self {
            transcript: transcript.to_string(),
            fail_start: false,
            events: None,
            log: Arc::clone(&log),
        };
        (stt, log)
    }

    pub fn unreachable() -> (Self, Arc<Mutex<TranscriberLog>>) {
        let (mut stt, log) = Self::new("");
        stt.fail_start = true;
        (stt, log)
    }
}

#[async_trait]
impl Transcriber for RecordingTranscriber {
    async fn start(
        &mut self,
        _config: &TranscriptionConfig,
        events: mpsc::UnboundedSender<TranscriptionEvent>,
    ) -> VoiceResult<()> {
        if self.fail_start {
            return Err(VoiceError::Connection("connection refused".to_string()));
        }
        self.log.lock().unwrap().started += 1;
        let _ = events.send(TranscriptionEvent::Ready);
        self.events = Some(events);
        Ok(())
    }

    async fn stop(&mut self) -> VoiceResult<()> {
        if self.events.take().is_some() {
            self.log.lock().unwrap().stopped += 1;
        }
        Ok(())
    }

    fn send_audio(&mut self, _frame: &AudioFrame) {
        self.log.lock().unwrap().frames += 1;
    }

    fn end_segment(&mut self) {
        self.log.lock().unwrap().segments += 1;
        if let Some(events) = &self.events {
            let _ = events.send(TranscriptionEvent::Transcript(self.transcript.clone()));
        }
    }

    fn is_ready(&self) -> bool {
        self.events.is_some()
    }
}

// -----------------------------------------------------------------------------
// Audio source
// -----------------------------------------------------------------------------

/// A device that cannot be opened.
pub struct MissingDevice;

impl AudioSource for MissingDevice {
    fn open(&mut self) -> VoiceResult<mpsc::UnboundedReceiver<CaptureEvent>> {
        Err(VoiceError::Acquisition("no input device".to_string()))
    }

    fn close(&mut self) {}
}
