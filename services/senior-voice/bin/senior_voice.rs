//! Main Entrypoint for the Senior Voice Client
//!
//! This binary is responsible for:
//! 1. Loading configuration from the environment and the command line.
//! 2. Loading or creating the durable user id.
//! 3. Wiring the microphone, speech synthesizer and conversation runtime.
//! 4. Rendering turns and notices, and reading record/end commands from stdin.

use anyhow::Context;
use clap::Parser;
use std::{path::PathBuf, sync::Arc};
use tracing::info;
use tripot_core::{SessionPolicy, VoiceSession};
use tripot_senior_voice::{
    Devices, RuntimeUpdate, VoiceRuntime,
    capture::{CpalMicrophone, CpalRecorder},
    config::Config,
    speech::EspeakSynthesizer,
    store::{KeyValueStore, load_or_create_user_id},
};

#[derive(Parser)]
#[command(name = "senior-voice")]
#[command(about = "Hands-free voice conversation with the Tripot companion", long_about = None)]
struct Args {
    /// Server `host:port`; overrides TRIPOT_SERVER.
    #[arg(long)]
    server: Option<String>,
    /// Directory for local data; overrides TRIPOT_DATA_DIR.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // --- 1. Load Configuration ---
    let mut config = Config::from_env().context("Failed to load configuration")?;
    if let Some(server) = args.server {
        config.server = server;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }

    // --- 2. Initialize Logging ---
    tracing_subscriber::fmt()
        .with_max_level(config.log_level)
        .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
        .with_writer(std::io::stderr)
        .init();
    info!(server = %config.server, data_dir = %config.data_dir.display(), "Configuration loaded.");

    // --- 3. Identity ---
    let store = KeyValueStore::new(&config.data_dir);
    let user_id = load_or_create_user_id(&store)
        .await
        .context("Failed to load user id")?;

    // --- 4. Wire the Session ---
    let session = VoiceSession::new(
        user_id,
        &config.server,
        config.speech.clone(),
        SessionPolicy::default(),
    );
    let devices = Devices {
        recorder: Box::new(CpalRecorder::new()),
        synthesizer: Arc::new(EspeakSynthesizer::new(config.tts_program.clone())),
        microphone: Arc::new(CpalMicrophone),
    };
    let (runtime, handle, mut updates) = VoiceRuntime::new(session, devices);

    tokio::spawn(async move {
        while let Some(update) = updates.recv().await {
            match update {
                RuntimeUpdate::Turn(turn) => println!(
                    "[{}] {}: {}",
                    turn.timestamp.format("%H:%M"),
                    turn.role,
                    turn.content
                ),
                RuntimeUpdate::Notice(notice) => println!("** {} **", notice),
                RuntimeUpdate::Status(status) => println!("({})", status),
            }
        }
    });

    // tokio's stdin would hold up runtime shutdown until the next line.
    let input = handle.clone();
    std::thread::spawn(move || {
        println!("Enter: 녹음 시작/중지, q: 대화 종료");
        for line in std::io::stdin().lines() {
            let Ok(line) = line else {
                break;
            };
            let sent = match line.trim() {
                "q" | "quit" => input.end_conversation(),
                _ => input.record_button(),
            };
            if !sent {
                break;
            }
        }
    });

    let interrupt = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received interrupt. Ending conversation...");
            interrupt.teardown();
        }
    });

    // --- 5. Run ---
    runtime.run().await.context("Voice session failed")?;
    info!("Goodbye.");
    Ok(())
}
