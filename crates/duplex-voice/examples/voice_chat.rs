//! Voice chat: microphone in, speaker out, with barge-in.
//!
//! Run with `cargo run --example voice_chat --features device`.
//! - **STT**: Deepgram live transcription if `DEEPGRAM_API_KEY` is set, else
//!   OpenAI-compatible transcription (`STT_API_KEY` or `OPENAI_API_KEY`).
//! - **Model**: OpenAI-compatible chat.
//! - **TTS**: Cartesia if `CARTESIA_API_KEY` is set, else OpenAI speech.
//!
//! Press Ctrl+C to stop.

use duplex_voice::providers::{
    CartesiaTts, DeepgramTranscriber, OpenAiChat, OpenAiSpeech, OpenAiTranscriber,
};
use duplex_voice::{
    Capabilities, ContextManager, InputMode, MicrophoneSource, Pipeline, PipelineEvent,
    SpeechSynthesizer, VoiceConfig, VoiceOutput,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = VoiceConfig::load()?;
    config.mode = InputMode::Voice;

    let model = Arc::new(OpenAiChat::from_env(config.generation.clone())?);
    let synthesizer: Arc<dyn SpeechSynthesizer> = match CartesiaTts::from_env(config.synthesis.clone()) {
        Ok(tts) => Arc::new(tts),
        Err(_) => Arc::new(OpenAiSpeech::from_env()?),
    };
    let caps = Capabilities::new(model, synthesizer);
    let caps = match DeepgramTranscriber::from_env() {
        Ok(stt) => caps.with_transcriber(stt),
        Err(_) => caps.with_transcriber(OpenAiTranscriber::from_env()?),
    };
    for device in MicrophoneSource::list_input_devices()? {
        info!("Input device: {}", device);
    }
    let caps = caps
        .with_audio_source(MicrophoneSource::new(config.audio.clone()))
        .with_context(ContextManager::default().with_window(config.generation.history_window));
    let (mut pipeline, mut events) = Pipeline::new(config.pipeline_config(), caps)?;
    let handle = pipeline.handle();
    let output = VoiceOutput::new()?;

    pipeline.start().await?;
    info!("🎤 Listening... speak something!");

    let ctrl_c_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            ctrl_c_handle.stop();
        }
    });

    // Playback lives on this task; report its state so the pipeline can detect barge-in.
    let playback = async {
        let mut poll = tokio::time::interval(Duration::from_millis(50));
        let mut playing = false;
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(PipelineEvent::Transcript(text)) => println!("\nYou said: {}", text),
                    Some(PipelineEvent::Response(delta)) => print!("{}", delta),
                    Some(PipelineEvent::AudioReady(audio)) => {
                        if let Err(e) = output.play_bytes(&audio) {
                            warn!("Playback failed: {}", e);
                        }
                    }
                    Some(PipelineEvent::Interrupted) => output.stop(),
                    Some(PipelineEvent::Error { kind, message }) => warn!("{:?}: {}", kind, message),
                    Some(_) => {}
                    None => break,
                },
                _ = poll.tick() => {
                    let now = output.is_playing();
                    if now != playing {
                        playing = now;
                        handle.set_audio_playing_state(playing);
                    }
                }
            }
        }
    };

    tokio::select! {
        result = pipeline.run() => result?,
        _ = playback => {}
    }
    info!("👋 Voice chat ended");
    Ok(())
}
