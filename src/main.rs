//! interview-live - connect to the interview relay, stream a WAV file as the
//! candidate's microphone and record the model's spoken replies.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use interview_live::config::{self, LiveConfig, PlaybackConfig};
use interview_live::media_in::WavFileSource;
use interview_live::media_out::{VolumeMeter, WavSink};
use interview_live::wire::ToolCall;
use interview_live::{SessionController, SessionEvent, ToolResponder, WsConnector};

#[derive(Parser, Debug)]
#[command(name = "interview-live")]
#[command(about = "Real-time voice session with the interview assistant", long_about = None)]
struct Args {
    /// Relay WebSocket endpoint
    #[arg(long, env = "INTERVIEW_LIVE_URL", default_value = config::DEFAULT_URL)]
    url: String,

    #[arg(long, env = "INTERVIEW_ID")]
    interview_id: Option<String>,

    #[arg(long, env = "CANDIDATE_ID")]
    candidate_id: Option<String>,

    /// Utterance sent once the session is set up
    #[arg(long, env = "INTERVIEW_OPENING_PROMPT")]
    opening_prompt: Option<String>,

    /// 16-bit mono WAV streamed as microphone input
    #[arg(long, value_name = "FILE")]
    input: Option<PathBuf>,

    /// Where the model's audio is written
    #[arg(long, value_name = "FILE", default_value = "model_output.wav")]
    output: PathBuf,

    /// Signal end of turn once the input file has been sent
    #[arg(long)]
    end_turn_after_input: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    info!("Starting interview-live against {}", args.url);

    let live = LiveConfig {
        url: args.url.clone(),
        session_context: config::session_context(args.interview_id.clone(), args.candidate_id.clone()),
        opening_prompt: args.opening_prompt.clone(),
        ..LiveConfig::default()
    };
    let playback = PlaybackConfig::default();
    let sink = WavSink::new(&args.output, playback.sample_rate);

    let (mut controller, handle) = SessionController::new(live, playback, WsConnector, sink);
    controller = controller.with_tool_handler(|call: ToolCall, responder: ToolResponder| {
        info!("🔧 Tool call: {}", call.raw);
        let results = call
            .calls
            .iter()
            .map(|c| json!({"id": c.id, "name": c.name, "response": {"status": "recorded"}}))
            .collect();
        if let Err(e) = responder.respond(results) {
            error!("Failed to answer tool call: {}", e);
        }
    });

    let input_len = match &args.input {
        Some(path) => {
            let source = WavFileSource::open(path)
                .with_context(|| format!("Failed to open input {}", path.display()))?;
            controller = controller.with_capture(source);
            Some(input_duration(path)?)
        }
        None => None,
    };

    let (meter, mut level) = VolumeMeter::new();
    handle.taps().register("volume", Box::new(meter));

    let mut events = handle.subscribe()?;
    let task = tokio::spawn(controller.run());

    handle
        .connect_with_retry()
        .await
        .context("Could not connect to the relay")?;

    if let (Some(len), true) = (input_len, args.end_turn_after_input) {
        let handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(len + Duration::from_millis(500)).await;
            if let Err(e) = handle.end_turn().await {
                warn!("Could not end turn: {}", e);
            }
        });
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received, shutting down");
                break;
            }
            Ok(()) = level.changed() => {
                let rms = *level.borrow_and_update();
                tracing::trace!("Output level {:.3}", rms);
            }
            event = events.recv() => match event {
                Some(SessionEvent::Connected) => info!("✅ Session active"),
                Some(SessionEvent::Interrupted) => info!("✋ Model interrupted"),
                Some(SessionEvent::TurnComplete) => info!("🏁 Model turn complete"),
                Some(SessionEvent::PlaybackComplete) => info!("🔇 Playback drained"),
                Some(SessionEvent::ToolCall(_)) => {}
                Some(SessionEvent::Error(e)) if e.is_fatal_for_session() => {
                    error!("Session lost: {}", e);
                    break;
                }
                Some(SessionEvent::Error(e)) => warn!("Session error: {}", e),
                Some(SessionEvent::Disconnected { reason }) => {
                    info!("Disconnected: {:?}", reason);
                    break;
                }
                None => break,
            },
        }
    }

    handle.shutdown().await.ok();
    let sink = task.await.context("Session task panicked")?;
    let path = sink.finish()?;
    info!("Model audio written to {}", path.display());
    Ok(())
}

fn input_duration(path: &Path) -> Result<Duration> {
    let reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    Ok(Duration::from_secs_f64(
        reader.duration() as f64 / spec.sample_rate as f64,
    ))
}
