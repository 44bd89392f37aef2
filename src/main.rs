use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tutor_live::config::TutorConfig;
use tutor_live::core::audio::{
    AudioClip, ClipId, InputDevice, NullInput, NullOutput, OutputDevice, WavFileInput,
    WavFileOutput,
};
use tutor_live::core::transport::{Speaker, WebSocketTransport};
use tutor_live::session::{
    HandshakeBuilder, Persistence, ReviewItem, SessionState, SessionTask, TutorSession,
};

/// Tutor Live - talk to a remote language tutor from the terminal
#[derive(Parser, Debug)]
#[command(name = "tutor-live")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tutor endpoint, overriding the configuration
    #[arg(short = 'e', long = "endpoint")]
    endpoint: Option<String>,

    /// File holding the lesson's scenario prompt
    #[arg(short = 's', long = "scenario", value_name = "FILE")]
    scenario: Option<PathBuf>,

    /// Lesson objective as ID=TEXT (repeatable)
    #[arg(short = 't', long = "task", value_name = "ID=TEXT")]
    tasks: Vec<String>,

    /// Review item as ID=CORRECTION (repeatable); makes this a review lesson
    #[arg(short = 'r', long = "review", value_name = "ID=CORRECTION")]
    review: Vec<String>,

    /// Recording for a review item as ID=WAV (repeatable)
    #[arg(long = "review-audio", value_name = "ID=WAV")]
    review_audio: Vec<String>,

    /// Stream this WAV file as the microphone
    #[arg(long = "input-wav", value_name = "FILE")]
    input_wav: Option<PathBuf>,

    /// Write tutor audio to this WAV file
    #[arg(long = "output-wav", value_name = "FILE")]
    output_wav: Option<PathBuf>,

    /// Use the host microphone and speakers
    #[cfg(feature = "native-audio")]
    #[arg(long = "native-audio")]
    native_audio: bool,

    /// Session length in minutes; the tutor is asked to wrap up when it runs out
    #[arg(short = 'm', long = "minutes")]
    minutes: Option<u64>,
}

const HELP: &str = "Commands:
  <text>            send a message
  /whisper <text>   ask for help in your own language
  /listen, /stop    open or close the microphone
  /mute             toggle the microphone mute
  /pause, /resume   pause or resume the session
  /interrupt        stop the tutor's audio
  /replay <id>      replay a recorded clip
  /reconnect        retry after a connection failure
  /end              end the session";

fn split_pair(value: &str) -> anyhow::Result<(String, String)> {
    let (id, text) = value
        .split_once('=')
        .ok_or_else(|| anyhow!("expected ID=VALUE, got '{value}'"))?;
    Ok((id.trim().to_string(), text.trim().to_string()))
}

fn devices(cli: &Cli) -> (Box<dyn InputDevice>, Arc<dyn OutputDevice>) {
    #[cfg(feature = "native-audio")]
    if cli.native_audio {
        use tutor_live::core::audio::{CpalInput, RodioOutput};
        match RodioOutput::new() {
            Ok(output) => return (Box::new(CpalInput::new()), Arc::new(output)),
            Err(e) => warn!("Speaker unavailable, falling back to files: {}", e),
        }
    }

    let input: Box<dyn InputDevice> = match &cli.input_wav {
        Some(path) => Box::new(WavFileInput::new(path)),
        None => Box::new(NullInput),
    };
    let output: Arc<dyn OutputDevice> = match &cli.output_wav {
        Some(path) => Arc::new(WavFileOutput::new(path)),
        None => Arc::new(NullOutput),
    };
    (input, output)
}

fn print_updates(previous: &SessionState, current: &SessionState) {
    if previous.phase != current.phase {
        println!("[{}]", current.phase);
    }
    for message in current.messages.iter().skip(previous.messages.len()) {
        let who = match message.speaker {
            Speaker::Tutor => "tutor",
            Speaker::User if message.is_whisper => "you (whisper)",
            Speaker::User => "you",
        };
        println!("{who}: {}", message.text);
    }
    for task in &current.completed_tasks {
        if !previous.completed_tasks.contains(task) {
            println!("* task complete: {task}");
        }
    }
    for badge in current.badges.iter().skip(previous.badges.len()) {
        println!("* badge: {}", badge.badge_id);
    }
    if current.connection_error != previous.connection_error {
        if let Some(error) = &current.connection_error {
            println!("! {error}");
            if current.can_reconnect {
                println!("  type /reconnect to try again");
            }
        }
    }
    if previous.summary.is_none() {
        if let Some(summary) = &current.summary {
            println!("\n{}", "*".repeat(usize::from(summary.stars)));
            println!("{}", summary.summary_text);
            println!("did well: {}", summary.did_well.join(", "));
            println!("work on:  {}", summary.work_on.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if it exists (must be done before config loading)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // Must be installed before any TLS connection is attempted
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => {
            info!("Loading configuration from {}", path.display());
            TutorConfig::from_file(path)
        }
        None => TutorConfig::from_lookup(|key| std::env::var(key).ok()),
    }?;
    if let Some(endpoint) = &cli.endpoint {
        config.endpoint = endpoint.clone();
    }
    config.validate()?;

    let scenario = match &cli.scenario {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read scenario {}", path.display()))?,
        None => "You are a friendly language tutor. Keep the conversation going.".to_string(),
    };
    let tasks = cli
        .tasks
        .iter()
        .map(|value| split_pair(value).map(|(id, text)| SessionTask::new(id, text)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut handshake = HandshakeBuilder::new(scenario).with_tasks(tasks.clone());
    let mut clips = Vec::new();
    if !cli.review.is_empty() || !cli.review_audio.is_empty() {
        for value in &cli.review_audio {
            let (id, path) = split_pair(value)?;
            clips.push(AudioClip::from_wav_file(ClipId::new(id), path)?);
        }
        let items = cli
            .review
            .iter()
            .map(|value| {
                split_pair(value).map(|(id, correction)| ReviewItem {
                    has_audio: clips.iter().any(|clip| clip.id.as_str() == id),
                    id,
                    correction,
                })
            })
            .collect::<anyhow::Result<Vec<_>>>()?;
        handshake = handshake.with_review_items(items);
    }

    let transport = Arc::new(WebSocketTransport::new(config.transport_config()));
    let (input, output) = devices(&cli);
    let mut builder = TutorSession::builder(transport)
        .settings(config.session_settings())
        .tasks(tasks)
        .input(input)
        .output(output);
    if let Some(client) = config.persistence_client()? {
        info!(session_id = client.session_id(), "Persistence enabled");
        let store: Arc<dyn Persistence> = Arc::new(client);
        builder = builder.persistence(store);
    }
    let session = builder.build();
    for clip in clips {
        session.preload_clip(clip);
    }

    let mut updates = session.subscribe();
    let printer = tokio::spawn(async move {
        let mut previous = updates.borrow().clone();
        while updates.changed().await.is_ok() {
            let current = updates.borrow_and_update().clone();
            print_updates(&previous, &current);
            previous = current;
        }
    });

    println!("{HELP}\n");
    if let Err(e) = session.start(handshake.build()).await {
        warn!("Initial connection failed: {}", e);
    }

    let deadline = cli.minutes.map(|minutes| Duration::from_secs(minutes * 60));
    run_repl(&session, deadline).await?;

    session.dispose();
    let _ = printer.await;
    Ok(())
}

async fn run_repl(session: &TutorSession, deadline: Option<Duration>) -> anyhow::Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut ended = session.subscribe();
    let expiry = async {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);
    let mut expired = false;

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = ended.wait_for(SessionState::is_ended) => break,
            _ = &mut expiry, if !expired => {
                println!("[time is up]");
                expired = true;
                session.notify_time_expired();
                continue;
            }
        };
        let Some(line) = line else {
            break;
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
        let result = match command {
            "/whisper" => session.send_text(rest, true).await,
            "/listen" => session.start_listening().await,
            "/stop" => {
                session.stop_listening().await;
                Ok(())
            }
            "/mute" => {
                session.toggle_mute();
                Ok(())
            }
            "/pause" => {
                session.pause();
                Ok(())
            }
            "/resume" => {
                session.resume();
                Ok(())
            }
            "/interrupt" => {
                session.interrupt();
                Ok(())
            }
            "/replay" => session.replay(&ClipId::new(rest.trim())).await,
            "/reconnect" => session.reconnect().await,
            "/end" => {
                session.trigger_end();
                Ok(())
            }
            "/help" => {
                println!("{HELP}");
                Ok(())
            }
            _ if command.starts_with('/') => {
                println!("unknown command {command}; /help lists them");
                Ok(())
            }
            _ => session.send_text(line, false).await,
        };
        if let Err(e) = result {
            println!("! {e}");
        }
    }
    Ok(())
}
