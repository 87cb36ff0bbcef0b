use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossbeam_channel::RecvTimeoutError;
use echoloop_core::{Aec3Engine, Diagnostic, Diagnostics, EchoController, ProcessingLoop};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

mod audio;
mod config;

use audio::{CpalCapture, CpalPlayback};
use config::AppConfig;

#[derive(Parser)]
#[command(name = "echoloop")]
#[command(
    about = "Live microphone-to-speaker loop with acoustic echo cancellation",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Run the loop in foreground (press Ctrl+C to stop)
    Run(RunArgs),
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Read settings from this file instead of the platform config dir
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(short, long)]
    input: Option<String>,
    #[arg(short, long)]
    output: Option<String>,
    /// 8000 or 16000
    #[arg(long)]
    sample_rate: Option<u32>,
    /// 80 or 160 samples
    #[arg(long)]
    frame_size: Option<usize>,
    /// 0 (mild) to 4 (most aggressive)
    #[arg(long)]
    aggressiveness: Option<i32>,
    /// Render/capture delay estimate in milliseconds
    #[arg(long)]
    delay_ms: Option<i32>,
    /// Enable echo cancellation
    #[arg(long)]
    aec: bool,
    #[arg(long)]
    no_comfort_noise: bool,
    /// Stop automatically after this many seconds
    #[arg(long)]
    duration_secs: Option<u64>,
}

impl RunArgs {
    /// Flags win over file values; absent flags leave the file value alone.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(input) = &self.input {
            config.input_device = input.clone();
        }
        if let Some(output) = &self.output {
            config.output_device = output.clone();
        }
        if let Some(rate) = self.sample_rate {
            config.sample_rate_hz = rate;
        }
        if let Some(size) = self.frame_size {
            config.frame_size = Some(size);
        }
        if let Some(mode) = self.aggressiveness {
            config.aggressiveness_mode = mode;
        }
        if let Some(delay) = self.delay_ms {
            config.delay_estimate_ms = delay;
        }
        if self.aec {
            config.echo_cancellation_enabled = true;
        }
        if self.no_comfort_noise {
            config.comfort_noise_enabled = false;
        }
    }
}

fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::List) => {
            audio::list_devices()?;
        }
        Some(Commands::Run(args)) => {
            run(args)?;
        }
        None => {
            println!("No command given.");
            println!("Use 'echoloop run' to start the loop or 'echoloop list' to see devices.");
        }
    }

    Ok(())
}

fn run(args: RunArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load(),
    };
    args.apply(&mut config);
    let session = config.resolve();

    let (diagnostics, events) = Diagnostics::channel_default();
    let controller =
        EchoController::with_diagnostics(Aec3Engine::new(), session.engine, diagnostics)
            .into_shared();
    let mut pipeline = ProcessingLoop::new(controller);
    pipeline
        .start(
            session.loop_settings,
            Box::new(CpalCapture::new(&session.input_device)),
            Box::new(CpalPlayback::new(&session.output_device)),
        )
        .context("Failed to start processing loop")?;

    println!(
        "echoloop active at {} with {}-sample frames, echo cancellation {}. Press Ctrl+C to stop.",
        session.loop_settings.sample_rate,
        session.loop_settings.frame_size.len(),
        if session.loop_settings.echo_cancellation { "on" } else { "off" }
    );

    // Graceful shutdown handling
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nShutting down gracefully...");
        r.store(false, Ordering::Relaxed);
    })?;

    let deadline = args
        .duration_secs
        .map(|secs| Instant::now() + Duration::from_secs(secs));
    while running.load(Ordering::Relaxed) && pipeline.is_running() {
        match events.recv_timeout(Duration::from_millis(100)) {
            Ok(Diagnostic::DeviceFailed { device, reason }) => {
                eprintln!("{} failed: {}", device, reason);
                break;
            }
            // Other events are already logged by the emitter
            Ok(_) | Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            break;
        }
    }

    let stats = pipeline.stop()?;
    println!(
        "echoloop stopped: {} frames, {} cancelled, {} passed through, {} read timeouts.",
        stats.frames, stats.cancelled, stats.passed_through, stats.read_timeouts
    );
    Ok(())
}
