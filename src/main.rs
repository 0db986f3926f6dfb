// SPDX-License-Identifier: GPL-3.0-only

use camkeeper::device::CameraSource;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camkeeper")]
#[command(about = "Resilient camera capture service")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Camera to use: an index (0) or a device path (/dev/video0)
    #[arg(short, long, default_value = "0", global = true)]
    source: CameraSource,

    /// Use the synthetic virtual camera instead of real hardware
    #[arg(long, global = true)]
    r#virtual: bool,

    /// Base directory for photos and recordings
    #[arg(short, long, global = true)]
    output: Option<PathBuf>,

    /// Settings file path (default: config dir)
    #[arg(long, global = true)]
    settings: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the capture service: streaming, watchdog and timelapse
    Run,

    /// List available cameras
    List,

    /// Take a photo
    Photo,

    /// Record a video
    Record {
        /// Recording duration in seconds
        #[arg(short, long, default_value = "10")]
        duration: u64,
    },

    /// Stream with a private device handle and report frame statistics
    Stream,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Set RUST_LOG to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camkeeper=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let args = Cli::parse();

    match args.command {
        Some(Commands::List) => cli::list_cameras(),
        Some(Commands::Photo) => {
            cli::take_photo(args.source, args.output, args.settings, args.r#virtual)
        }
        Some(Commands::Record { duration }) => cli::record_video(
            args.source,
            duration,
            args.output,
            args.settings,
            args.r#virtual,
        ),
        Some(Commands::Stream) => cli::run_stream(args.source, args.settings, args.r#virtual),
        Some(Commands::Run) | None => {
            cli::run_service(args.source, args.output, args.settings, args.r#virtual)
        }
    }
}
