//! Text chat: typed turns through the full pipeline.
//!
//! Replies stream to stdout and are synthesized (the byte count is logged).
//! - **Model**: OpenAI-compatible chat (`LLM_API_KEY` or `OPENAI_API_KEY`).
//! - **TTS**: Cartesia if `CARTESIA_API_KEY` is set, else OpenAI speech.
//!
//! Type `exit` to quit.

use duplex_voice::providers::{CartesiaTts, OpenAiChat, OpenAiSpeech};
use duplex_voice::{
    Capabilities, ContextManager, InputMode, Pipeline, PipelineEvent, SpeechSynthesizer,
    ToolRegistry, ToolSpec, TurnOutcome, VoiceConfig,
};
use serde_json::json;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

fn demo_tools() -> ToolRegistry {
    let mut tools = ToolRegistry::new();
    tools.register(
        ToolSpec::new(
            "log_fruit",
            "Record a fruit the user mentioned",
            json!({
                "type": "object",
                "properties": {"name": {"type": "string", "enum": ["banana", "apple"]}},
                "required": ["name"]
            }),
        ),
        |args| {
            info!("🍌 Fruit logged: {}", args["name"]);
            Ok(())
        },
    );
    tools
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut config = VoiceConfig::load()?;
    config.mode = InputMode::Text;

    let model = Arc::new(OpenAiChat::from_env(config.generation.clone())?);
    let synthesizer: Arc<dyn SpeechSynthesizer> = match CartesiaTts::from_env(config.synthesis.clone()) {
        Ok(tts) => Arc::new(tts),
        Err(_) => Arc::new(OpenAiSpeech::from_env()?),
    };
    let context = ContextManager::default().with_window(config.generation.history_window);

    let caps = Capabilities::new(model, synthesizer)
        .with_context(context)
        .with_tools(demo_tools());
    let (mut pipeline, mut events) = Pipeline::new(config.pipeline_config(), caps)?;

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                PipelineEvent::Response(delta) => {
                    print!("{}", delta);
                    let _ = std::io::stdout().flush();
                }
                PipelineEvent::ToolCall(call) => println!("\n[tool] {}({})", call.name, call.arguments_json),
                PipelineEvent::AudioReady(audio) => info!("🔊 {} bytes of audio", audio.len()),
                PipelineEvent::Error { kind, message } => warn!("{:?}: {}", kind, message),
                _ => {}
            }
        }
    });

    pipeline.start().await?;
    println!("Type a message (or `exit`):");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.eq_ignore_ascii_case("exit") {
            break;
        }
        if line.is_empty() {
            continue;
        }
        match pipeline.send_text(line).await? {
            TurnOutcome::Replied(_) => println!(),
            TurnOutcome::Failed => println!("\n(turn failed)"),
            _ => {}
        }
    }

    pipeline.stop().await?;
    Ok(())
}
