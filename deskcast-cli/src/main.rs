//! deskcast — desktop capture harness.
//!
//! ```text
//! deskcast record --output out.y4m --seconds 10    Capture to a Y4M file
//! deskcast record --raw --output out               Capture raw frames
//! deskcast screens                                 List monitors
//! deskcast discover --listen-secs 10               Announce and list peers
//! deskcast --gen-config                            Print default config TOML
//! ```

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use deskcast_core::discovery::{DiscoveryInfo, DiscoveryListener, DiscoveryService};
use deskcast_core::node::{Node, Processor, Sink, Source};
use deskcast_core::processors::{ConverterConfig, PixelFormatConverter, VideoScaler};
use deskcast_core::sinks::{RawRecorder, Y4mRecorder};
use deskcast_core::{FrameFormat, Pipeline, ScreenCapturer, Technology};

use config::AppConfig;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "deskcast", about = "Desktop capture pipeline harness")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "deskcast.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Capture the screen into a file.
    Record {
        /// Output path (Y4M container unless --raw).
        #[arg(short, long, default_value = "capture.y4m")]
        output: PathBuf,

        /// Recording duration in seconds (0 = run until Ctrl-C).
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,

        /// Capture frame rate (overrides config).
        #[arg(long)]
        fps: Option<u32>,

        /// Scale to this width (0 = native).
        #[arg(long, default_value_t = 0)]
        width: u32,

        /// Scale to this height (0 = native).
        #[arg(long, default_value_t = 0)]
        height: u32,

        /// Dump raw captured frames instead of Y4M/I420.
        #[arg(long)]
        raw: bool,
    },

    /// List available screens.
    Screens,

    /// Announce this instance and print discovered peers.
    Discover {
        /// How long to listen (0 = run until Ctrl-C).
        #[arg(long, default_value_t = 0)]
        listen_secs: u64,
    },
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    if cli.gen_config {
        println!("{}", toml::to_string_pretty(&AppConfig::default())?);
        return Ok(());
    }

    let config = AppConfig::load(&cli.config);

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.logging.level.clone())),
        )
        .init();

    match cli.command {
        Some(Command::Record {
            output,
            seconds,
            fps,
            width,
            height,
            raw,
        }) => record(config, output, seconds, fps, width, height, raw).await,
        Some(Command::Screens) => screens(config),
        Some(Command::Discover { listen_secs }) => discover(config, listen_secs).await,
        None => {
            eprintln!("no command given; try `deskcast record` or `deskcast --help`");
            std::process::exit(-1);
        }
    }
}

// ── record ───────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
async fn record(
    config: AppConfig,
    output: PathBuf,
    seconds: u64,
    fps: Option<u32>,
    width: u32,
    height: u32,
    raw: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut capture_config = config.capture.clone();
    if let Some(fps) = fps {
        capture_config.frame_rate = fps;
    }

    let capturer = match ScreenCapturer::new(capture_config, Technology::Auto) {
        Ok(c) => Arc::new(c),
        Err(e) => {
            error!(error = %e, "failed to create screen capturer");
            std::process::exit(-1);
        }
    };
    info!(backend = capturer.technology_name(), "capture backend selected");

    let mut pipeline = Pipeline::new();
    pipeline.set_source(Arc::clone(&capturer) as Arc<dyn Source>);

    // Optional scaling stage.
    let scaler = if width > 0 && height > 0 {
        let mut scaler_config = config.scaler.clone();
        scaler_config.target_width = width;
        scaler_config.target_height = height;
        let scaler = Arc::new(VideoScaler::new(scaler_config));
        pipeline.add_processor(Arc::clone(&scaler) as Arc<dyn Processor>);
        Some(scaler)
    } else {
        None
    };

    // Y4M needs I420; raw keeps whatever the platform produced.
    if !raw {
        let converter = Arc::new(PixelFormatConverter::new(ConverterConfig {
            input_format: FrameFormat::Bgra32,
            output_format: FrameFormat::I420,
            enable_threading: false,
        }));
        if !converter.initialize() {
            error!("failed to initialize pixel format converter");
            std::process::exit(-1);
        }
        pipeline.add_processor(converter as Arc<dyn Processor>);
    }

    let y4m_recorder = if raw { None } else { Some(Y4mRecorder::new(&output)) };
    let raw_recorder = if raw {
        let mut prefix = output.clone();
        prefix.set_extension("");
        Some(RawRecorder::new(prefix))
    } else {
        None
    };

    if let Some(recorder) = &y4m_recorder {
        pipeline.set_sink(Arc::clone(recorder) as Arc<dyn Sink>);
    }
    if let Some(recorder) = &raw_recorder {
        pipeline.set_sink(Arc::clone(recorder) as Arc<dyn Sink>);
    }

    if let Some(scaler) = &scaler {
        if !scaler.initialize() {
            error!("failed to initialize scaler");
            std::process::exit(-1);
        }
    }
    if !capturer.initialize() {
        error!("failed to initialize screen capture");
        std::process::exit(-1);
    }

    if !pipeline.link_all() {
        error!("failed to link pipeline");
        std::process::exit(-1);
    }
    info!("{}", pipeline.pipeline_info());

    if !pipeline.start() {
        error!("failed to start pipeline");
        pipeline.stop();
        std::process::exit(-1);
    }

    if seconds > 0 {
        info!(seconds, "recording (Ctrl-C to stop early)");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(seconds)) => {
                info!("recording time elapsed");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping");
            }
        }
    } else {
        info!("recording until Ctrl-C");
        tokio::signal::ctrl_c().await?;
        info!("interrupted, stopping");
    }

    pipeline.stop();

    if let Some(recorder) = &y4m_recorder {
        recorder.print_summary();
    }
    if let Some(recorder) = &raw_recorder {
        println!(
            "Recorded {} frames ({:.2} MB) to {}",
            recorder.frames_written(),
            recorder.bytes_written() as f64 / (1024.0 * 1024.0),
            recorder
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "<no frames captured>".into()),
        );
    }

    Ok(())
}

// ── screens ──────────────────────────────────────────────────────

fn screens(config: AppConfig) -> Result<(), Box<dyn std::error::Error>> {
    let capturer = match ScreenCapturer::new(config.capture, Technology::Auto) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "failed to create screen capturer");
            std::process::exit(-1);
        }
    };

    let screens = capturer.available_screens();
    if screens.is_empty() {
        println!("No screens found (headless environment?)");
        return Ok(());
    }

    println!("Backend: {}", capturer.technology_name());
    for screen in screens {
        println!(
            "  [{}] {} — {}x{} @ ({}, {}), {} bpp{}",
            screen.id,
            screen.name,
            screen.width,
            screen.height,
            screen.x,
            screen.y,
            screen.bits_per_pixel,
            if screen.is_primary { " (primary)" } else { "" },
        );
    }
    Ok(())
}

// ── discover ─────────────────────────────────────────────────────

struct PeerPrinter;

impl DiscoveryListener for PeerPrinter {
    fn on_found(&self, info: &DiscoveryInfo) {
        println!(
            "peer: {} id={} at {}:{} (version {})",
            info.kind, info.id, info.ip, info.port, info.version
        );
    }
}

async fn discover(
    config: AppConfig,
    listen_secs: u64,
) -> Result<(), Box<dyn std::error::Error>> {
    let service = DiscoveryService::new(config.discovery);
    let listener: Arc<dyn DiscoveryListener> = Arc::new(PeerPrinter);
    service.set_listener(&listener);

    println!("announcing as id={} — listening for peers…", service.id());
    service.start();

    if listen_secs > 0 {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(listen_secs)) => {}
            _ = tokio::signal::ctrl_c() => {}
        }
    } else {
        tokio::signal::ctrl_c().await?;
    }

    service.stop().await;
    Ok(())
}
