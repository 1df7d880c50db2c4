// SPDX-License-Identifier: GPL-3.0-only

use camrig::Config;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camrig")]
#[command(about = "Hot-plug camera manager with synchronized multi-camera capture")]
#[command(version = env!("GIT_VERSION"))]
#[command(subcommand_required = false)]
struct Cli {
    /// Configuration file (default: ~/.config/camrig/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log camrig debug output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage attached cameras (default)
    Run,

    /// List attached cameras
    List,

    /// Capture from several cameras and report how well their frames align
    SyncCapture {
        /// Video node to capture from (repeat for each camera)
        #[arg(short, long = "device", required = true, num_args = 1..)]
        devices: Vec<String>,

        #[arg(long, default_value = "1920")]
        width: u32,

        #[arg(long, default_value = "1080")]
        height: u32,

        #[arg(long, default_value = "30")]
        fps: u32,

        /// Stop after this many aligned sets
        #[arg(short, long, default_value = "300")]
        frames: u64,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // RUST_LOG controls the level unless --verbose is given
    // Examples: RUST_LOG=debug, RUST_LOG=camrig=trace
    let filter = if cli.verbose {
        tracing_subscriber::EnvFilter::new("camrig=debug")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_level(true)
        .init();

    let config_path = cli.config.or_else(Config::default_path);
    let config = match &config_path {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match cli.command {
        None | Some(Commands::Run) => cli::run_daemon(config),
        Some(Commands::List) => cli::list_devices(),
        Some(Commands::SyncCapture {
            devices,
            width,
            height,
            fps,
            frames,
        }) => cli::sync_capture(&config, devices, width, height, fps, frames),
    }
}
