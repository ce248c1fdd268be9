//! Voice activity detection and speech segmentation
//!
//! Each frame is classified voice/silence by a pluggable [`FrameClassifier`].
//! The detector turns the classification stream into segment events:
//!
//! ```text
//! silence ──voice──▶ speaking ──silence──▶ SpeechEnd(segment)  (run >= min_speech_ms)
//!                        │                 Misfire              (run <  min_speech_ms)
//!                        └─ if audio is playing: Interrupt, then SpeechStart
//! ```
//!
//! Events go out over an unbounded channel in the order they are produced, so
//! `Interrupt` is always observed before the `SpeechStart` it precedes.

use crate::audio::{AudioFrame, SpeechSegment};
use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Configuration for voice activity detection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Sample rate every frame must carry (default: 16000)
    pub sample_rate: u32,

    /// RMS level (normalized 0.0..1.0) above which the energy classifier reports voice
    pub energy_threshold: f32,

    /// Voice runs shorter than this are reported as misfires (default: 250ms)
    pub min_speech_ms: u64,

    /// Trailing silence needed to close a segment. 0 closes on the first silence frame.
    pub end_silence_ms: u64,

    /// Segments are force-closed at this length (default: 30s)
    pub max_segment_ms: u64,

    /// WebRTC aggressiveness (0-3, where 3 is most aggressive)
    pub webrtc_mode: u8,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            energy_threshold: 0.01,
            min_speech_ms: 250,
            end_silence_ms: 0,
            max_segment_ms: 30_000,
            webrtc_mode: 2,
        }
    }
}

impl VadConfig {
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sample_rate == 0 {
            return Err(VoiceError::Config("VAD sample rate must be non-zero".to_string()));
        }
        if self.webrtc_mode > 3 {
            return Err(VoiceError::Config(format!(
                "VAD mode must be 0-3, got {}",
                self.webrtc_mode
            )));
        }
        if self.max_segment_ms <= self.min_speech_ms {
            return Err(VoiceError::Config(format!(
                "max_segment_ms ({}) must exceed min_speech_ms ({})",
                self.max_segment_ms, self.min_speech_ms
            )));
        }
        Ok(())
    }
}

/// Classifies a single frame as voice or silence.
pub trait FrameClassifier {
    fn is_voice(&mut self, frame: &AudioFrame) -> VoiceResult<bool>;

    /// Drop any internal state between sessions.
    fn reset(&mut self) {}
}

/// RMS energy threshold classifier.
#[derive(Debug, Clone)]
pub struct EnergyClassifier {
    threshold: f32,
}

impl EnergyClassifier {
    pub fn new(threshold: f32) -> Self {
        Self { threshold }
    }

    fn rms(samples: &[i16]) -> f32 {
        if samples.is_empty() {
            return 0.0;
        }
        let sum_squares: f32 = samples
            .iter()
            .map(|&s| {
                let x = s as f32 / 32768.0;
                x * x
            })
            .sum();
        (sum_squares / samples.len() as f32).sqrt()
    }
}

impl FrameClassifier for EnergyClassifier {
    fn is_voice(&mut self, frame: &AudioFrame) -> VoiceResult<bool> {
        Ok(Self::rms(&frame.samples) > self.threshold)
    }
}

// -----------------------------------------------------------------------------
// WebRTC classifier (feature `webrtc`). The underlying handle is !Send.
// -----------------------------------------------------------------------------
#[cfg(feature = "webrtc")]
mod webrtc {
    use super::*;
    use webrtc_vad::{SampleRate, Vad, VadMode};

    /// Voice classifier backed by the WebRTC VAD.
    ///
    /// Frames must be 10, 20 or 30ms long at 8, 16, 32 or 48 kHz.
    pub struct WebRtcClassifier {
        vad: Vad,
        sample_rate: u32,
        mode: u8,
    }

    impl WebRtcClassifier {
        pub fn new(sample_rate: u32, mode: u8) -> VoiceResult<Self> {
            info!(
                "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
                sample_rate, mode
            );
            let vad = Self::build(sample_rate, mode)?;
            Ok(Self {
                vad,
                sample_rate,
                mode,
            })
        }

        fn build(sample_rate: u32, mode: u8) -> VoiceResult<Vad> {
            let rate = match sample_rate {
                8000 => SampleRate::Rate8kHz,
                16000 => SampleRate::Rate16kHz,
                32000 => SampleRate::Rate32kHz,
                48000 => SampleRate::Rate48kHz,
                other => {
                    return Err(VoiceError::Config(format!(
                        "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
                        other
                    )))
                }
            };
            let vad_mode = match mode {
                0 => VadMode::Quality,
                1 => VadMode::LowBitrate,
                2 => VadMode::Aggressive,
                _ => VadMode::VeryAggressive,
            };
            let mut vad = Vad::new();
            vad.set_mode(vad_mode);
            vad.set_sample_rate(rate);
            Ok(vad)
        }
    }

    impl FrameClassifier for WebRtcClassifier {
        fn is_voice(&mut self, frame: &AudioFrame) -> VoiceResult<bool> {
            self.vad
                .is_voice_segment(&frame.samples)
                .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))
        }

        fn reset(&mut self) {
            // WebRTC VAD has no explicit reset, recreate it
            if let Ok(vad) = Self::build(self.sample_rate, self.mode) {
                self.vad = vad;
            }
        }
    }
}

#[cfg(feature = "webrtc")]
pub use webrtc::WebRtcClassifier;

/// Events emitted by the detector
#[derive(Debug, Clone, PartialEq)]
pub enum VadEvent {
    /// Voice began while synthesized audio was playing. Always precedes its `SpeechStart`.
    Interrupt,
    SpeechStart,
    SpeechEnd(SpeechSegment),
    /// Voice run too short to be a real segment.
    Misfire { duration: Duration },
}

/// Segments a frame stream into speech segments.
pub struct VoiceActivityDetector {
    config: VadConfig,
    classifier: Box<dyn FrameClassifier>,
    active: bool,
    speaking: bool,
    audio_playing: bool,

    segment: SpeechSegment,
    voice_duration: Duration,
    trailing_silence: Vec<AudioFrame>,

    event_tx: mpsc::UnboundedSender<VadEvent>,
}

impl VoiceActivityDetector {
    /// Create a detector with the given classifier
    pub fn new(
        config: VadConfig,
        classifier: Box<dyn FrameClassifier>,
    ) -> VoiceResult<(Self, mpsc::UnboundedReceiver<VadEvent>)> {
        config.validate()?;
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let detector = Self {
            config,
            classifier,
            active: false,
            speaking: false,
            audio_playing: false,
            segment: SpeechSegment::new(),
            voice_duration: Duration::ZERO,
            trailing_silence: Vec::new(),
            event_tx,
        };
        Ok((detector, event_rx))
    }

    /// Create a detector using the RMS energy classifier.
    pub fn with_energy(config: VadConfig) -> VoiceResult<(Self, mpsc::UnboundedReceiver<VadEvent>)> {
        let classifier = EnergyClassifier::new(config.energy_threshold);
        Self::new(config, Box::new(classifier))
    }

    pub fn start(&mut self) -> VoiceResult<()> {
        if self.active {
            return Err(VoiceError::InvalidState("VAD is already active".to_string()));
        }
        self.reset_segment();
        self.classifier.reset();
        self.active = true;
        info!("🎙️ Voice activity detection started");
        Ok(())
    }

    /// Stop detection. Safe to call when already stopped.
    pub fn stop(&mut self) {
        if !self.active {
            return;
        }
        self.active = false;
        self.audio_playing = false;
        self.reset_segment();
        info!("🛑 Voice activity detection stopped");
    }

    /// Report whether synthesized audio is currently audible.
    pub fn set_audio_playing_state(&mut self, playing: bool) {
        self.audio_playing = playing;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn is_speaking(&self) -> bool {
        self.speaking
    }

    /// Classify one frame and advance the segmentation state.
    ///
    /// Frames fed while the detector is stopped are ignored.
    pub fn feed(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        if !self.active {
            return Ok(());
        }
        if frame.sample_rate != self.config.sample_rate {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {}Hz frames, got {}Hz",
                self.config.sample_rate, frame.sample_rate
            )));
        }

        if self.classifier.is_voice(&frame)? {
            self.on_voice(frame)
        } else {
            self.on_silence(frame)
        }
    }

    fn on_voice(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        if !self.speaking {
            debug!("Speech started");
            self.reset_segment();
            self.speaking = true;

            if self.audio_playing {
                info!("⚡ Voice during playback, interrupting");
                self.emit(VadEvent::Interrupt)?;
            }
            self.emit(VadEvent::SpeechStart)?;
        } else if !self.trailing_silence.is_empty() {
            // Speech resumed inside the end-of-speech hangover
            for silent in self.trailing_silence.drain(..) {
                self.segment.push(silent);
            }
        }

        self.voice_duration += frame.duration();
        self.segment.push(frame);

        if self.segment.duration() >= Duration::from_millis(self.config.max_segment_ms) {
            info!("⏱️ Max segment duration reached, closing segment");
            return self.close_segment();
        }
        Ok(())
    }

    fn on_silence(&mut self, frame: AudioFrame) -> VoiceResult<()> {
        if !self.speaking {
            return Ok(());
        }
        if self.config.end_silence_ms == 0 {
            return self.close_segment();
        }

        self.trailing_silence.push(frame);
        let silence: Duration = self.trailing_silence.iter().map(AudioFrame::duration).sum();
        if silence >= Duration::from_millis(self.config.end_silence_ms) {
            return self.close_segment();
        }
        Ok(())
    }

    fn close_segment(&mut self) -> VoiceResult<()> {
        self.speaking = false;
        self.trailing_silence.clear();
        let voiced = std::mem::replace(&mut self.voice_duration, Duration::ZERO);
        let segment = std::mem::take(&mut self.segment);

        if voiced < Duration::from_millis(self.config.min_speech_ms) {
            debug!("⏭️ Speech too short ({:?}), misfire", voiced);
            return self.emit(VadEvent::Misfire { duration: voiced });
        }

        debug!(
            "Speech ended: {:?}, {} frames",
            segment.duration(),
            segment.frame_count()
        );
        self.emit(VadEvent::SpeechEnd(segment))
    }

    fn reset_segment(&mut self) {
        self.speaking = false;
        self.segment.clear();
        self.trailing_silence.clear();
        self.voice_duration = Duration::ZERO;
    }

    fn emit(&self, event: VadEvent) -> VoiceResult<()> {
        self.event_tx
            .send(event)
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FRAME: usize = 320; // 20ms at 16kHz

    fn voice() -> AudioFrame {
        AudioFrame::new(vec![8000; FRAME], 16000)
    }

    fn silence() -> AudioFrame {
        AudioFrame::new(vec![0; FRAME], 16000)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<VadEvent>) -> Vec<VadEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    fn started(config: VadConfig) -> (VoiceActivityDetector, mpsc::UnboundedReceiver<VadEvent>) {
        let (mut vad, rx) = VoiceActivityDetector::with_energy(config).unwrap();
        vad.start().unwrap();
        (vad, rx)
    }

    #[test]
    fn energy_classifier_separates_voice_and_silence() {
        let mut c = EnergyClassifier::new(0.01);
        assert!(c.is_voice(&voice()).unwrap());
        assert!(!c.is_voice(&silence()).unwrap());
    }

    #[test]
    fn segment_closes_on_first_silence_frame() {
        let (mut vad, mut rx) = started(VadConfig::default());
        for _ in 0..20 {
            vad.feed(voice()).unwrap();
        }
        vad.feed(silence()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], VadEvent::SpeechStart);
        match &events[1] {
            VadEvent::SpeechEnd(segment) => {
                assert_eq!(segment.frame_count(), 20);
                assert_eq!(segment.duration(), Duration::from_millis(400));
            }
            other => panic!("expected SpeechEnd, got {:?}", other),
        }
        assert!(!vad.is_speaking());
    }

    #[test]
    fn short_run_is_a_misfire() {
        let (mut vad, mut rx) = started(VadConfig::default());
        for _ in 0..5 {
            vad.feed(voice()).unwrap(); // 100ms
        }
        vad.feed(silence()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events[0], VadEvent::SpeechStart);
        assert_eq!(
            events[1],
            VadEvent::Misfire {
                duration: Duration::from_millis(100)
            }
        );
        assert!(!events.iter().any(|e| matches!(e, VadEvent::SpeechEnd(_))));
    }

    #[test]
    fn interrupt_precedes_speech_start_while_playing() {
        let (mut vad, mut rx) = started(VadConfig::default());
        vad.set_audio_playing_state(true);
        vad.feed(voice()).unwrap();

        let events = drain(&mut rx);
        assert_eq!(events, vec![VadEvent::Interrupt, VadEvent::SpeechStart]);
    }

    #[test]
    fn continuous_voice_starts_one_segment() {
        let (mut vad, mut rx) = started(VadConfig::default());
        vad.set_audio_playing_state(true);
        for _ in 0..20 {
            vad.feed(voice()).unwrap();
        }
        assert!(vad.is_speaking());
        assert_eq!(drain(&mut rx), vec![VadEvent::Interrupt, VadEvent::SpeechStart]);

        vad.feed(silence()).unwrap();
        assert!(!vad.is_speaking());
        match drain(&mut rx).as_slice() {
            [VadEvent::SpeechEnd(segment)] => assert_eq!(segment.frame_count(), 20),
            other => panic!("expected one SpeechEnd, got {:?}", other),
        }
    }

    #[test]
    fn no_interrupt_when_nothing_is_playing() {
        let (mut vad, mut rx) = started(VadConfig::default());
        vad.set_audio_playing_state(true);
        vad.set_audio_playing_state(false);
        vad.feed(voice()).unwrap();
        assert_eq!(drain(&mut rx), vec![VadEvent::SpeechStart]);
    }

    #[test]
    fn hangover_keeps_short_pauses_inside_segment() {
        let config = VadConfig {
            end_silence_ms: 100,
            ..Default::default()
        };
        let (mut vad, mut rx) = started(config);
        for _ in 0..10 {
            vad.feed(voice()).unwrap();
        }
        for _ in 0..2 {
            vad.feed(silence()).unwrap(); // 40ms pause, below hangover
        }
        for _ in 0..10 {
            vad.feed(voice()).unwrap();
        }
        for _ in 0..5 {
            vad.feed(silence()).unwrap(); // 100ms closes
        }

        let events = drain(&mut rx);
        assert_eq!(events.len(), 2);
        match &events[1] {
            VadEvent::SpeechEnd(segment) => assert_eq!(segment.frame_count(), 22),
            other => panic!("expected SpeechEnd, got {:?}", other),
        }
    }

    #[test]
    fn max_segment_forces_close() {
        let config = VadConfig {
            max_segment_ms: 400,
            ..Default::default()
        };
        let (mut vad, mut rx) = started(config);
        for _ in 0..25 {
            vad.feed(voice()).unwrap();
        }
        let events = drain(&mut rx);
        assert_eq!(events[0], VadEvent::SpeechStart);
        assert!(matches!(&events[1], VadEvent::SpeechEnd(s) if s.frame_count() == 20));
        // the remaining voice opens a new segment
        assert_eq!(events[2], VadEvent::SpeechStart);
    }

    #[test]
    fn frames_ignored_until_started_and_after_stop() {
        let (mut vad, mut rx) = VoiceActivityDetector::with_energy(VadConfig::default()).unwrap();
        vad.feed(voice()).unwrap();
        assert!(drain(&mut rx).is_empty());

        vad.start().unwrap();
        assert!(vad.start().is_err());
        vad.feed(voice()).unwrap();
        vad.stop();
        vad.stop();
        vad.feed(voice()).unwrap();
        assert_eq!(drain(&mut rx), vec![VadEvent::SpeechStart]);
        assert!(!vad.is_speaking());
    }

    #[test]
    fn wrong_sample_rate_is_rejected() {
        let (mut vad, _rx) = started(VadConfig::default());
        let result = vad.feed(AudioFrame::new(vec![0; 441], 44100));
        assert!(matches!(result, Err(VoiceError::VadProcessing(_))));
    }

    #[test]
    fn invalid_config_is_rejected() {
        let config = VadConfig {
            webrtc_mode: 7,
            ..Default::default()
        };
        assert!(VoiceActivityDetector::with_energy(config).is_err());
    }

    #[test]
    fn every_end_matches_one_start() {
        let (mut vad, mut rx) = started(VadConfig::default());
        let pattern = [3usize, 1, 15, 2, 20, 1, 4, 3, 13, 2];
        for (i, run) in pattern.iter().enumerate() {
            for _ in 0..*run {
                if i % 2 == 0 {
                    vad.feed(voice()).unwrap();
                } else {
                    vad.feed(silence()).unwrap();
                }
            }
        }

        let mut open = 0;
        for event in drain(&mut rx) {
            match event {
                VadEvent::SpeechStart => {
                    assert_eq!(open, 0);
                    open += 1;
                }
                VadEvent::SpeechEnd(_) | VadEvent::Misfire { .. } => {
                    assert_eq!(open, 1);
                    open -= 1;
                }
                VadEvent::Interrupt => {}
            }
        }
    }
}
