use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use reachy_bridge::config::{AudioConfig, Mode, Overrides};
use reachy_bridge::gateway::{GatewaySession, SessionOptions, WsConnector};
use reachy_bridge::robot::{ActionExecutor, IdleMotion, Robot, SimulatedRobot};
use reachy_bridge::voice::capture::FrameBuffer;
use reachy_bridge::voice::{
    AudioCapture, AudioInput, AudioPlayback, AudioSink, FrameSource, Microphone, PLAYBACK_SAMPLE_RATE,
    Segmenter, Speaker, TranscriptSpotter, WakeWordGate, calculate_energy, sine_tone, stt, tts,
};
use reachy_bridge::{Config, ConversationLoop, Error, LoopOptions, demo};

/// Reachy Bridge - Talk to an AI gateway through a Reachy Mini robot
#[derive(Parser)]
#[command(name = "reachy", version, about)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Gateway host
    #[arg(long, env = "OPENCLAW_HOST")]
    gateway_host: Option<String>,

    /// Gateway port
    #[arg(long, env = "OPENCLAW_PORT")]
    gateway_port: Option<u16>,

    /// Gateway bearer token
    #[arg(long, env = "OPENCLAW_TOKEN", hide_env_values = true)]
    gateway_token: Option<String>,

    /// Speech-to-text backend
    #[arg(
        long,
        env = "STT_BACKEND",
        value_parser = ["local", "whisper", "faster-whisper", "openai", "deepgram"]
    )]
    stt: Option<String>,

    /// Whisper model size (e.g. tiny, base, small)
    #[arg(long, env = "WHISPER_MODEL")]
    whisper_model: Option<String>,

    /// Phrase required before each utterance
    #[arg(long, env = "WAKE_WORD")]
    wake_word: Option<String>,

    /// Don't play emotions
    #[arg(long)]
    no_emotions: bool,

    /// Don't run idle animations
    #[arg(long)]
    no_idle: bool,

    /// Echo transcripts locally without a gateway
    #[arg(long, conflicts_with = "demo")]
    standalone: bool,

    /// Run the scripted action demo and exit
    #[arg(long)]
    demo: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        let mode = if self.demo {
            Some(Mode::Demo)
        } else if self.standalone {
            Some(Mode::Standalone)
        } else {
            None
        };
        Overrides {
            gateway_host: self.gateway_host.clone(),
            gateway_port: self.gateway_port,
            gateway_token: self.gateway_token.clone(),
            stt_backend: self.stt.clone(),
            whisper_model: self.whisper_model.clone(),
            wake_word: self.wake_word.clone(),
            no_emotions: self.no_emotions,
            no_idle: self.no_idle,
            mode,
        }
    }
}

#[derive(Subcommand)]
#[allow(clippy::enum_variant_names)]
enum Command {
    /// Test microphone input
    TestMic {
        /// Duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
    },
    /// Test speaker output
    TestSpeaker,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let filter = match cli.verbose {
        0 => "info,reachy_bridge=info",
        1 => "info,reachy_bridge=debug",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    let _ = rustls::crypto::ring::default_provider().install_default();

    let cancel = CancellationToken::new();
    spawn_shutdown_listener(cancel.clone());

    match run(cli, cancel).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("fatal: {e:#}");
            exit_code(&e)
        }
    }
}

fn exit_code(error: &anyhow::Error) -> ExitCode {
    match error.downcast_ref::<Error>() {
        Some(Error::Connect(_)) => ExitCode::from(2),
        _ => ExitCode::FAILURE,
    }
}

fn spawn_shutdown_listener(cancel: CancellationToken) {
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown requested");
        cancel.cancel();
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

async fn run(cli: Cli, cancel: CancellationToken) -> anyhow::Result<()> {
    // Handle subcommands
    if let Some(cmd) = &cli.command {
        return match cmd {
            Command::TestMic { duration } => test_mic(*duration, &cancel).await,
            Command::TestSpeaker => test_speaker().await,
        };
    }

    let config = Arc::new(Config::load(&cli.overrides())?);
    tracing::debug!(?config, "loaded configuration");
    tracing::info!(mode = ?config.mode, gateway = %config.gateway.url(), "starting reachy bridge");

    let robot: Arc<dyn Robot> = Arc::new(SimulatedRobot::realtime());
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;

    let speaker = Arc::new(Speaker::new(
        tts::from_config(&config, client.clone()),
        Arc::new(AudioPlayback),
        Arc::clone(&robot),
        config.behavior.play_emotions,
        cancel.child_token(),
    ));
    let executor = ActionExecutor::new(
        Arc::clone(&robot),
        Arc::clone(&speaker),
        config.robot.clone(),
    );

    if config.mode == Mode::Demo {
        demo::run(&executor, &cancel).await;
        return Ok(());
    }

    let transcriber = stt::from_config(&config, client)?;
    let mut capture = AudioCapture::new(Arc::new(Microphone), config.audio.clone());
    if let Some(phrase) = &config.behavior.wake_word {
        let spotter = Arc::new(TranscriptSpotter::new(Arc::clone(&transcriber)));
        let gate = WakeWordGate::new(
            phrase,
            spotter,
            config.behavior.keep_awake,
            config.audio.frame_size,
            config.audio.silence_threshold,
        );
        let cue = Arc::clone(&speaker);
        capture = capture.with_wake_gate(gate).on_wake(move || {
            let cue = Arc::clone(&cue);
            tokio::spawn(async move { cue.wake_cue().await });
        });
    }

    let mut conversation = ConversationLoop::new(
        capture,
        transcriber,
        Arc::clone(&speaker),
        executor,
        LoopOptions::from_config(&config),
        cancel.clone(),
    );

    let idle_cancel = cancel.child_token();
    let idle = config.behavior.idle_animations.then(|| {
        IdleMotion::new(
            Arc::clone(&robot),
            config.behavior.idle_interval,
            conversation.state(),
            conversation.speech_activity(),
        )
        .spawn(idle_cancel.clone())
    });

    let result = if config.mode == Mode::Standalone {
        conversation.run_standalone().await
    } else {
        let token = config
            .gateway
            .token
            .as_ref()
            .map(|t| SecretString::from(t.expose_secret().to_string()));
        let connector = Arc::new(WsConnector::new(config.gateway.url(), token));
        let options = SessionOptions {
            retry: config.gateway.retry.clone(),
            ping_interval: config.gateway.ping_interval,
        };

        match GatewaySession::connect(connector, options, &cancel).await {
            Ok(mut session) => {
                let result = conversation.run(&mut session).await;
                session.shutdown().await;
                result
            }
            // Interrupted during the initial connect
            Err(_) if cancel.is_cancelled() => Ok(()),
            Err(e) => Err(e),
        }
    };

    idle_cancel.cancel();
    if let Some(handle) = idle {
        if let Err(e) = handle.await {
            tracing::warn!(error = %e, "idle motion ended abnormally");
        }
    }

    result?;
    tracing::info!("reachy bridge stopped");
    Ok(())
}

/// Test microphone input
async fn test_mic(duration: u64, cancel: &CancellationToken) -> anyhow::Result<()> {
    println!("Testing microphone for {duration} seconds...");
    println!("Speak into your microphone!\n");

    let audio = AudioConfig::default();
    let mut source = Microphone.open(audio.sample_rate)?;
    let mut framer = FrameBuffer::new(audio.frame_size);
    let mut segmenter = Segmenter::new(&audio);

    println!("Sample rate: {} Hz", audio.sample_rate);
    println!("---");

    let deadline = Instant::now() + Duration::from_secs(duration);
    let mut next_report = Instant::now() + Duration::from_secs(1);
    let mut window = Vec::new();
    let mut second = 0;

    while Instant::now() < deadline && !cancel.is_cancelled() {
        let chunk = tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep_until(next_report) => None,
            chunk = source.next_chunk() => Some(chunk?),
        };

        if let Some(chunk) = chunk {
            window.extend_from_slice(&chunk);
            framer.push(&chunk);
            while let Some(frame) = framer.next_frame() {
                if let Some(segment) = segmenter.push(&frame) {
                    #[allow(clippy::cast_precision_loss)]
                    let secs = segment.samples.len() as f32 / audio.sample_rate as f32;
                    println!("  -> utterance: {secs:.2}s ({:?})", segment.boundary);
                }
            }
        }

        if Instant::now() >= next_report {
            second += 1;
            next_report += Duration::from_secs(1);

            let energy = calculate_energy(&window);
            let peak = window.iter().map(|s| s.abs()).fold(0.0f32, f32::max);

            // Visual meter
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let meter_len = (energy * 100.0).min(50.0) as usize;
            let meter: String = "█".repeat(meter_len) + &" ".repeat(50 - meter_len);
            let marker = if energy > audio.silence_threshold { "*" } else { " " };

            println!("[{second:2}s] RMS: {energy:.4} | Peak: {peak:.4} | [{meter}] {marker}");
            window.clear();
        }
    }

    drop(source);

    println!("\n---");
    println!("If you saw movement in the meter, your mic is working!");
    println!("Lines marked * are above the silence threshold.");
    println!("If RMS stayed near 0, check:");
    println!("  1. Is your mic plugged in?");
    println!("  2. Run: pactl info | grep 'Default Source'");
    println!("  3. Run: arecord -l (to list devices)");

    Ok(())
}

/// Test speaker output with a sine wave
async fn test_speaker() -> anyhow::Result<()> {
    println!("Testing speaker output...");
    println!("You should hear a 440Hz tone for 2 seconds\n");

    let samples = sine_tone(440.0, Duration::from_secs(2), PLAYBACK_SAMPLE_RATE);
    println!(
        "Playing {} samples at {} Hz...",
        samples.len(),
        PLAYBACK_SAMPLE_RATE
    );

    tokio::task::spawn_blocking(move || {
        AudioPlayback.play(samples, PLAYBACK_SAMPLE_RATE, &AtomicBool::new(false))
    })
    .await??;

    println!("\n---");
    println!("If you heard the tone, your speakers are working!");
    println!("If you didn't hear anything, check:");
    println!("  1. Run: pactl info | grep 'Default Sink'");
    println!("  2. Run: pactl list sinks short");

    Ok(())
}
