use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

use voiceturn::vad::{Environment, VadParams, VoiceActivityDetector};
use voiceturn::voice::{
    self, AudioChunk, CpalCapture, CpalSink, FrameQueue, FrameSource, PLAYBACK_SAMPLE_RATE,
    PlaybackBuffer, SAMPLE_RATE,
};
use voiceturn::{Config, SessionEvent, TurnState, VoiceSession};

/// voiceturn - Real-time voice assistant client
#[derive(Parser)]
#[command(name = "voiceturn", version, about)]
struct Cli {
    /// Voice service base URL
    #[arg(long, env = "VOICETURN_SERVER_URL")]
    server_url: Option<String>,

    /// Tenant id
    #[arg(long, env = "VOICETURN_TENANT_ID")]
    tenant: Option<String>,

    /// Training module
    #[arg(long, env = "VOICETURN_MODULE")]
    module: Option<String>,

    /// Acoustic environment (quiet, moderate, noisy, auto)
    #[arg(short, long, env = "VOICETURN_ENVIRONMENT")]
    environment: Option<Environment>,

    /// Interrupt playback automatically when you start talking
    #[arg(long)]
    auto_barge_in: bool,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Calibrate and show a live voice activity meter
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,

        /// Write the captured audio to a WAV file
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Play a test tone through the playback buffer
    TestSpeaker,
    /// List input devices
    Devices,
    /// Print the environment preset table
    Presets,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,voiceturn=info",
        1 => "info,voiceturn=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .init();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = Config::load()?;
    if let Some(url) = cli.server_url {
        config.server.url = url;
    }
    if let Some(tenant) = cli.tenant {
        config.session.tenant_id = tenant;
    }
    if let Some(module) = cli.module {
        config.session.module = module;
    }
    if let Some(environment) = cli.environment {
        config.audio.environment = environment;
    }
    if cli.auto_barge_in {
        config.audio.auto_barge_in = true;
    }

    match cli.command {
        Some(Command::TestMic { duration, save }) => test_mic(&config, duration, save).await,
        Some(Command::TestSpeaker) => test_speaker().await,
        Some(Command::Devices) => list_devices(),
        Some(Command::Presets) => {
            print_presets();
            Ok(())
        }
        None => interactive(&config).await,
    }
}

/// Run an interactive voice session driven from stdin
async fn interactive(config: &Config) -> anyhow::Result<()> {
    let session = VoiceSession::start(config)?;
    let handle = session.handle().clone();

    session.dispatcher().register("log_event", |args| {
        println!("[function] log_event {}", serde_json::Value::Object(args.clone()));
        Ok(())
    });

    let mut events = handle.subscribe();
    let printer = tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::StateChanged { to, .. }) => println!("[{to}]"),
                Ok(SessionEvent::Text(text)) => println!("assistant: {text}"),
                Ok(SessionEvent::FunctionCall { name }) => println!("[call] {name}"),
                Ok(SessionEvent::SpeechStarted) => println!("[speech]"),
                Ok(SessionEvent::SpeechEnded) => println!("[silence]"),
                Ok(SessionEvent::Error(e)) => println!("[error] {e}"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!(skipped = n, "event printer lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    handle.initialize().await?;
    match handle.calibrate().await {
        Ok(profile) => println!(
            "Calibrated: noise floor {:.4}, environment {}",
            profile.noise_floor_rms, profile.environment
        ),
        Err(e) => println!("Calibration failed ({e}), using default thresholds"),
    }

    println!("Enter = start/stop listening | i = interrupt | t <text> = send text | q = quit");

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let line = line.trim();
        let result = match line {
            "" => match handle.state() {
                TurnState::Listening => handle.stop_listening().await,
                TurnState::Error => handle.initialize().await,
                _ => handle.start_listening().await,
            },
            "i" => handle.interrupt_speech().await,
            "q" => break,
            _ => match line.strip_prefix("t ") {
                Some(text) => handle.send_text(text.trim()).await,
                None => {
                    println!("unknown command: {line}");
                    Ok(())
                }
            },
        };

        if let Err(e) = result {
            println!("[error] {e}");
            if !e.is_recoverable() {
                break;
            }
        }
    }

    session.shutdown().await?;
    printer.abort();
    Ok(())
}

/// Calibrate, then print a live VAD meter
async fn test_mic(config: &Config, duration: u64, save: Option<PathBuf>) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Stay quiet for a moment while calibrating.\n");

    let queue = Arc::new(FrameQueue::new(64));
    let mut capture = CpalCapture::new(config.audio.frame_size);
    capture.initialize()?;
    let producer = Arc::clone(&queue);
    capture.start_capture(Box::new(move |frame| {
        producer.push(frame);
    }))?;

    let mut vad = VoiceActivityDetector::new(config.vad_config())?;
    let mut recorded: Vec<f32> = Vec::new();

    vad.begin_calibration();
    let mut calibrated = Duration::ZERO;
    while calibrated < config.audio.calibration {
        let frame = queue.pop().await;
        calibrated += frame.duration();
        recorded.extend_from_slice(frame.samples());
        vad.process(&frame);
    }
    match vad.finish_calibration() {
        Ok(profile) => println!(
            "Noise floor: {:.4} ({})\n---",
            profile.noise_floor_rms, profile.environment
        ),
        Err(e) => {
            println!("Calibration failed ({e}), using default thresholds\n---");
            vad.use_defaults();
        }
    }

    let total = Duration::from_secs(duration);
    let mut elapsed = Duration::ZERO;
    while elapsed < total {
        let frame = queue.pop().await;
        elapsed += frame.duration();
        recorded.extend_from_slice(frame.samples());
        let result = vad.process(&frame);

        // Visual meter
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let meter_len = (result.probability * 40.0).round() as usize;
        let meter = "#".repeat(meter_len) + &" ".repeat(40 - meter_len.min(40));
        println!(
            "[{:5.2}s] RMS: {:.4} | p: {:.2} | [{}] {}",
            elapsed.as_secs_f32(),
            result.rms,
            result.probability,
            meter,
            if result.is_speech { "SPEECH" } else { "" }
        );
    }

    capture.stop_capture();
    if queue.dropped() > 0 {
        println!("({} frames dropped while printing)", queue.dropped());
    }

    if let Some(path) = save {
        let wav = voice::samples_to_wav(&recorded, SAMPLE_RATE)?;
        std::fs::write(&path, wav)?;
        println!("Saved {} samples to {}", recorded.len(), path.display());
    }

    println!("\n---");
    println!("If SPEECH appeared while you talked, capture and detection work.");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: voiceturn devices");
    println!("  3. Run: pactl info | grep 'Default Source'");

    Ok(())
}

/// Play a 440Hz tone through the playback buffer
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let playback = PlaybackBuffer::new(Arc::new(CpalSink::new()?));

    let frequency = 440.0_f32;
    #[allow(clippy::cast_precision_loss)]
    let samples: Vec<f32> = (0..PLAYBACK_SAMPLE_RATE * 2)
        .map(|i| {
            let t = i as f32 / PLAYBACK_SAMPLE_RATE as f32;
            (2.0 * std::f32::consts::PI * frequency * t).sin() * 0.3 // 30% volume
        })
        .collect();

    // Quarter-second chunks, as the service streams them
    for chunk in samples.chunks(PLAYBACK_SAMPLE_RATE as usize / 4) {
        playback.enqueue(AudioChunk::new(chunk.to_vec(), PLAYBACK_SAMPLE_RATE))?;
    }
    println!("Queued {} chunks...", playback.len());

    playback.wait_idle().await;
    playback.close().await;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}

fn list_devices() -> anyhow::Result<()> {
    let devices = voice::list_input_devices()?;
    if devices.is_empty() {
        println!("No input devices found");
    }
    for name in devices {
        println!("{name}");
    }
    Ok(())
}

fn print_presets() {
    println!(
        "{:<9} {:>6} {:>7} {:>5} {:>9} {:>9} {:>8} {:>4}",
        "preset", "vad", "rms", "mult", "speechMs", "silenceMs", "maxSil", "pad"
    );
    for env in Environment::ALL {
        let p = VadParams::for_environment(env);
        println!(
            "{:<9} {:>6.2} {:>7.3} {:>5.1} {:>9} {:>9} {:>8} {:>4}",
            env.as_str(),
            p.vad_threshold,
            p.rms_base_threshold,
            p.noise_floor_multiplier,
            p.min_speech_duration_ms,
            p.silence_duration_ms,
            p.max_silence_frames,
            p.positive_speech_pad_frames
        );
    }
}
