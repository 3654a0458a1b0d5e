//! IntelliSolve - terminal control tray for a Gemini Live session
//!
//! Streams the microphone and, on request, the screen to the model. Charts the
//! model draws through `render_altair` are saved under `./charts`.

#![forbid(unsafe_code)]

mod chart;

use anyhow::Result;
use intellisolve::media_in::{Microphone, NativeDevices, VideoSourceKind};
use intellisolve::{EventKind, InboundEvent, LiveConfig, Session, SessionController, ToolRegistry};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SYSTEM_INSTRUCTION: &str = "You are my helpful assistant. Any time I ask you for a graph call the \
    \"render_altair\" function I have provided you. Dont ask for additional information just make your best judgement.";

const HELP: &str = "commands: c connect | d disconnect | m mute/unmute | s share screen | x stop video | \
    t <text> send text | q quit";

#[cfg(feature = "pulse")]
fn microphone() -> Box<dyn Microphone> {
    Box::new(intellisolve::audio::PulseMicrophone::new("intellisolve"))
}

#[cfg(not(feature = "pulse"))]
fn microphone() -> Box<dyn Microphone> {
    Box::new(intellisolve::media_in::UnavailableMicrophone)
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    info!("Starting IntelliSolve");

    let config = LiveConfig {
        system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
        google_search: true,
        ..LiveConfig::from_env()?
    };

    let mut registry = ToolRegistry::new();
    registry.register(chart::declaration(), chart::ChartWriter::new("charts"))?;

    let mut controller = SessionController::new(config, registry, microphone(), Box::new(NativeDevices));

    println!("{HELP}");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));

        match command {
            "c" => match controller.connect().await {
                Ok(()) => {
                    if let Some(session) = controller.session() {
                        spawn_transcript(session);
                    }
                }
                Err(e) => error!("Connect failed: {}", e),
            },
            "d" => controller.disconnect().await,
            "m" => {
                let muted = !controller.is_muted();
                controller.set_muted(muted);
                println!("{}", if muted { "muted" } else { "unmuted" });
            }
            "s" => {
                if let Err(e) = controller.set_video_source(Some(VideoSourceKind::Screen)).await {
                    warn!("Screen sharing unavailable: {}", e);
                }
            }
            "x" => {
                controller.set_video_source(None).await?;
            }
            "t" if !rest.is_empty() => {
                if let Err(e) = controller.send_text(rest) {
                    warn!("Text not sent: {}", e);
                }
            }
            "q" => break,
            "" => {}
            _ => println!("{HELP}"),
        }
    }

    controller.disconnect().await;
    info!("Bye");
    Ok(())
}

/// Print the model's side of the conversation until the session ends.
fn spawn_transcript(session: &Session) {
    let mut events = session.subscribe(&[
        EventKind::TextOut,
        EventKind::OutputTranscription,
        EventKind::InputTranscription,
        EventKind::TurnComplete,
        EventKind::Interrupted,
        EventKind::GoAway,
        EventKind::Error,
    ]);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                InboundEvent::TextOut { text } | InboundEvent::OutputTranscription { text } => {
                    println!("model: {text}");
                }
                InboundEvent::InputTranscription { text } => println!("you: {text}"),
                InboundEvent::TurnComplete => info!("Turn complete"),
                InboundEvent::Interrupted => info!("Model interrupted"),
                InboundEvent::GoAway { time_left } => warn!("Server closing soon ({:?} left)", time_left),
                InboundEvent::Error { message } => error!("Server error: {}", message),
                _ => {}
            }
        }
    });
}
