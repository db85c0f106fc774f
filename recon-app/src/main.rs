//! Recon Application
//!
//! Command-line front end for turning photo sets into point models or meshes.
//!
//! Subcommands:
//! - `run`: reconstruct a directory of images
//! - `probe`: report the detected training backend and accelerator
//! - `inspect`: summarize a PLY point cloud

mod app;

use clap::{Parser, Subcommand};
use recon_pipeline::{BackendKind, Branch};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Recon - photogrammetry pipeline driver
#[derive(Parser, Debug)]
#[command(name = "recon")]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Reconstruct a model from a directory of JPEG/PNG images
    Run(RunArgs),
    /// Show which training backend and accelerator would be used
    Probe,
    /// Print point count, fields and bounds of a PLY file
    Inspect {
        /// PLY file to read
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
pub struct RunArgs {
    /// Directory containing the input images
    #[arg(short, long)]
    input: PathBuf,

    /// Each run writes into its own subdirectory here
    #[arg(short, long, default_value = "results")]
    output_root: PathBuf,

    /// Pipeline branch (splat, mesh)
    #[arg(short, long)]
    branch: Option<Branch>,

    /// Force a training backend (primary, secondary, simulated)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Fewer training iterations and smaller stereo windows
    #[arg(long)]
    fast: bool,

    /// Maximum dense points used to initialize training
    #[arg(long)]
    point_cap: Option<usize>,

    /// Longest image side after normalization
    #[arg(long)]
    max_dimension: Option<u32>,

    /// Maximum features extracted per image
    #[arg(long)]
    feature_cap: Option<u32>,

    /// Never pass GPU flags to tools
    #[arg(long)]
    no_acceleration: bool,

    /// Print progress events as JSON lines
    #[arg(long)]
    json: bool,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let result = match args.command {
        Command::Run(run) => app::run(run).await,
        Command::Probe => app::probe().await,
        Command::Inspect { path } => app::inspect(&path),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}
