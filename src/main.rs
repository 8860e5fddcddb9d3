// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "camera-pipeline")]
#[command(about = "Multi-consumer capture pipeline for V4L2 image sensors")]
#[command(version)]
struct Cli {
    /// Configuration file (default: <config dir>/camera-pipeline/config.json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 nodes and the configured sensors
    List,

    /// Parse a parameter blob and print its entries with their types
    Params {
        /// `key=value;key=value` text (default: the parameters of the preset)
        blob: Option<String>,

        /// Sensor preset whose parameters to print
        #[arg(short, long, default_value = "0")]
        preset: usize,
    },

    /// Print the configuration as JSON
    Config,

    /// Run preview, a picture and a recording on the virtual device
    Simulate {
        /// Sensor preset to open
        #[arg(short, long, default_value = "0")]
        preset: usize,

        /// Recording duration in seconds
        #[arg(short, long, default_value = "3")]
        duration: u64,

        /// Picture output path (default: ~/Pictures/camera-pipeline/picture_TIMESTAMP.jpg)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=camera_pipeline=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();
    let config = cli.config.as_deref();

    match cli.command {
        Commands::List => cli::list_nodes(config),
        Commands::Params { blob, preset } => cli::print_params(config, blob.as_deref(), preset),
        Commands::Config => cli::print_config(config),
        Commands::Simulate {
            preset,
            duration,
            output,
        } => cli::simulate(config, preset, duration, output),
    }
}
