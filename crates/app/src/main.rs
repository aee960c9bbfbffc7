mod audio;
mod config;
mod simulate;
mod wav;

use anyhow::Result;
use bargein_core::AecProcessor;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::AppConfig;

#[derive(Parser)]
#[command(name = "bargein")]
#[command(about = "Echo cancellation tooling for barge-in voice satellites", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List available audio devices
    List,
    /// Play a prompt and echo-cancel the microphone live
    Run {
        /// Microphone device name (or "default")
        #[arg(short, long)]
        input: Option<String>,

        /// Speaker device name (or "default")
        #[arg(short, long)]
        output: Option<String>,

        /// 48kHz WAV file played as the far-end prompt
        #[arg(short, long)]
        play: PathBuf,

        /// Capture mic/reference/output WAVs for this run
        #[arg(long)]
        record: bool,

        /// Measure the speaker-to-mic delay while the prompt plays
        #[arg(long)]
        calibrate: bool,

        /// Stop playback after this many seconds, like a barge-in
        #[arg(long)]
        interrupt_after: Option<f32>,
    },
    /// Echo-cancel a recorded microphone file against its reference
    Simulate {
        #[arg(long)]
        mic: PathBuf,

        #[arg(long)]
        reference: PathBuf,

        #[arg(long)]
        out: PathBuf,

        /// Output delay applied to each reference write
        #[arg(long, default_value_t = 0)]
        delay_ms: u32,

        /// Estimate the delay by cross-correlation
        #[arg(long)]
        calibrate: bool,
    },
    /// Write the current configuration file, creating it with defaults
    InitConfig,
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let app_config = AppConfig::load();

    match cli.command {
        Commands::List => audio::list_devices()?,
        Commands::Run {
            input,
            output,
            play,
            record,
            calibrate,
            interrupt_after,
        } => {
            let input = input.unwrap_or_else(|| app_config.input_device.clone());
            let output = output.unwrap_or_else(|| app_config.output_device.clone());
            run_loopback(&app_config, &input, &output, &play, record, calibrate, interrupt_after)?;
        }
        Commands::Simulate {
            mic,
            reference,
            out,
            delay_ms,
            calibrate,
        } => {
            let stats = simulate::run(app_config.aec.clone(), &mic, &reference, &out, delay_ms, calibrate)?;
            simulate::print_stats(&stats);
        }
        Commands::InitConfig => {
            let path = app_config.save()?;
            println!("Configuration written to {}", path.display());
        }
    }

    Ok(())
}

fn run_loopback(
    app_config: &AppConfig,
    input: &str,
    output: &str,
    play: &std::path::Path,
    record: bool,
    calibrate: bool,
    interrupt_after: Option<f32>,
) -> Result<()> {
    let prompt = wav::read_mono(play)?;
    let processor = Arc::new(AecProcessor::with_aec3(app_config.aec.clone()));

    if let Some(dir) = &app_config.recording_dir {
        processor.set_recording_dir(dir.clone());
    }
    if record || app_config.record_sessions {
        processor.enable_recording(true);
        let paths = processor.start_recording()?;
        println!("Recording to {}", paths.mic.parent().unwrap_or(paths.mic.as_path()).display());
    }
    if calibrate {
        processor.request_calibration();
    }

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })?;

    let engine = audio::LoopbackEngine::start(processor.clone(), input, output, prompt)?;
    println!("Running echo cancellation. Press Ctrl+C to stop.");

    let started = Instant::now();
    let mut interrupted = false;
    while running.load(Ordering::SeqCst) {
        std::thread::sleep(Duration::from_millis(100));
        if let Some(secs) = interrupt_after {
            if !interrupted && started.elapsed().as_secs_f32() >= secs {
                engine.interrupt();
                interrupted = true;
            }
        }
    }

    drop(engine);
    if let Some(summary) = processor.stop_recording() {
        println!(
            "Recorded {} mic samples ({} blocks dropped)",
            summary.mic_samples, summary.dropped_blocks
        );
    }
    simulate::print_stats(&processor.get_stats());
    processor.close();
    println!("Stopped.");
    Ok(())
}
