//! Audio frames, segments and capture sources
//!
//! Frames are fixed-length PCM16 mono blocks delivered strictly in temporal
//! order. A capture source hands them to the pipeline over a channel so the
//! device callback never touches pipeline state.

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Audio configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Number of channels (default: 1 for mono)
    pub channels: u16,

    /// Frame size in samples (default: 480 for 30ms at 16kHz)
    pub frame_size: usize,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            channels: 1,
            frame_size: 480, // 30ms at 16kHz
        }
    }
}

/// One fixed-length block of PCM16 mono samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    pub sample_rate: u32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    /// Build a frame from normalized f32 samples (-1.0..1.0).
    pub fn from_f32(samples: &[f32], sample_rate: u32) -> Self {
        let samples = samples
            .iter()
            .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();
        Self::new(samples, sample_rate)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn duration(&self) -> Duration {
        samples_to_duration(self.samples.len(), self.sample_rate)
    }

    /// Little-endian PCM16 bytes, the wire format for `linear16` transcription.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.samples.len() * 2);
        for s in &self.samples {
            bytes.extend_from_slice(&s.to_le_bytes());
        }
        bytes
    }
}

/// Ordered run of frames from a speech start to its matching speech end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeechSegment {
    frames: Vec<AudioFrame>,
}

impl SpeechSegment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, frame: AudioFrame) {
        self.frames.push(frame);
    }

    pub fn frames(&self) -> &[AudioFrame] {
        &self.frames
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn duration(&self) -> Duration {
        self.frames.iter().map(AudioFrame::duration).sum()
    }

    /// All samples of the segment, concatenated.
    pub fn samples(&self) -> Vec<i16> {
        self.frames
            .iter()
            .flat_map(|f| f.samples.iter().copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }
}

fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate as u64)
}

/// Encode PCM16 mono samples as an in-memory WAV file for API upload.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut wav = Vec::with_capacity(44 + samples.len() * 2);
    {
        let mut writer = hound::WavWriter::new(Cursor::new(&mut wav), spec)?;
        for &sample in samples {
            writer.write_sample(sample)?;
        }
        writer.finalize()?;
    }
    Ok(wav)
}

/// What a capture source delivers to the pipeline.
#[derive(Debug, Clone)]
pub enum CaptureEvent {
    Frame(AudioFrame),
    /// Device failure after start. Fatal to the session.
    Error(String),
}

/// A source of audio frames (microphone, network feed, test harness).
///
/// `open` acquires the device and returns the frame channel; failure is an
/// [`VoiceError::Acquisition`]. `close` releases the device and is idempotent.
pub trait AudioSource {
    fn open(&mut self) -> VoiceResult<mpsc::UnboundedReceiver<CaptureEvent>>;
    fn close(&mut self);
}

type SenderSlot = Arc<Mutex<Option<mpsc::UnboundedSender<CaptureEvent>>>>;

/// Source fed by the caller through a [`FrameSender`].
///
/// Each `open` creates a fresh channel, so a pipeline can be stopped and
/// started again with the same source.
pub struct ChannelSource {
    slot: SenderSlot,
}

/// Push side of a [`ChannelSource`].
#[derive(Clone)]
pub struct FrameSender {
    slot: SenderSlot,
}

impl ChannelSource {
    pub fn new() -> (Self, FrameSender) {
        let slot: SenderSlot = Arc::new(Mutex::new(None));
        (
            Self {
                slot: Arc::clone(&slot),
            },
            FrameSender { slot },
        )
    }
}

impl AudioSource for ChannelSource {
    fn open(&mut self) -> VoiceResult<mpsc::UnboundedReceiver<CaptureEvent>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut slot = self
            .slot
            .lock()
            .map_err(|e| VoiceError::Acquisition(format!("frame source lock poisoned: {}", e)))?;
        *slot = Some(tx);
        debug!("Channel source opened");
        Ok(rx)
    }

    fn close(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            slot.take();
        }
    }
}

impl FrameSender {
    /// Deliver one frame. Fails when the source is not open.
    pub fn send(&self, frame: AudioFrame) -> VoiceResult<()> {
        self.deliver(CaptureEvent::Frame(frame))
    }

    /// Report a device failure.
    pub fn fail(&self, reason: impl Into<String>) -> VoiceResult<()> {
        self.deliver(CaptureEvent::Error(reason.into()))
    }

    pub fn is_open(&self) -> bool {
        self.slot.lock().map(|s| s.is_some()).unwrap_or(false)
    }

    fn deliver(&self, event: CaptureEvent) -> VoiceResult<()> {
        let slot = self
            .slot
            .lock()
            .map_err(|e| VoiceError::ChannelSend(e.to_string()))?;
        match slot.as_ref() {
            Some(tx) => tx
                .send(event)
                .map_err(|e| VoiceError::ChannelSend(e.to_string())),
            None => Err(VoiceError::ChannelSend("frame source is closed".to_string())),
        }
    }
}

// -----------------------------------------------------------------------------
// Microphone capture via CPAL (feature `device`).
// -----------------------------------------------------------------------------
#[cfg(feature = "device")]
mod microphone {
    use super::*;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
    use cpal::{Stream, StreamConfig};
    use tracing::warn;

    /// Default input device, chunked into fixed frames.
    pub struct MicrophoneSource {
        config: AudioConfig,
        stream: Option<Stream>,
    }

    impl MicrophoneSource {
        pub fn new(config: AudioConfig) -> Self {
            Self {
                config,
                stream: None,
            }
        }

        /// List available input devices
        pub fn list_input_devices() -> VoiceResult<Vec<String>> {
            let host = cpal::default_host();
            let devices = host.input_devices()?;
            Ok(devices.filter_map(|d| d.name().ok()).collect())
        }
    }

    impl AudioSource for MicrophoneSource {
        fn open(&mut self) -> VoiceResult<mpsc::UnboundedReceiver<CaptureEvent>> {
            info!(
                "🎤 Opening microphone ({}Hz, {} channels)",
                self.config.sample_rate, self.config.channels
            );

            let device = cpal::default_host()
                .default_input_device()
                .ok_or_else(|| VoiceError::Acquisition("No input device available".to_string()))?;
            info!(
                "📱 Using input device: {}",
                device.name().unwrap_or_else(|_| "Unknown".to_string())
            );
            let default_config = device.default_input_config()?;
            debug!("Default input config: {:?}", default_config);

            let stream_config = StreamConfig {
                channels: self.config.channels,
                sample_rate: cpal::SampleRate(self.config.sample_rate),
                buffer_size: cpal::BufferSize::Fixed(self.config.frame_size as u32),
            };

            let (tx, rx) = mpsc::unbounded_channel();
            let err_tx = tx.clone();
            let frame_size = self.config.frame_size;
            let sample_rate = self.config.sample_rate;
            let mut pending: Vec<f32> = Vec::with_capacity(frame_size);

            let stream = device.build_input_stream(
                &stream_config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    for &sample in data {
                        pending.push(sample);
                        if pending.len() >= frame_size {
                            let frame = AudioFrame::from_f32(&pending, sample_rate);
                            pending.clear();
                            if tx.send(CaptureEvent::Frame(frame)).is_err() {
                                return;
                            }
                        }
                    }
                },
                move |err| {
                    warn!("Audio stream error: {}", err);
                    let _ = err_tx.send(CaptureEvent::Error(err.to_string()));
                },
                None,
            )?;
            stream.play()?;
            self.stream = Some(stream);

            info!("✅ Microphone capture started");
            Ok(rx)
        }

        fn close(&mut self) {
            if self.stream.take().is_some() {
                info!("🛑 Microphone capture stopped");
            }
        }
    }
}

#[cfg(feature = "device")]
pub use microphone::MicrophoneSource;
