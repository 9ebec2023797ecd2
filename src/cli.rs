use clap::{Args as ClapArgs, Parser, Subcommand};
use std::path::PathBuf;

use crate::enhancement::{Intensity, Upscale};

#[derive(Parser, Debug)]
#[command(
    name = "headshot-processor",
    version,
    about = "Face-aware crop and AI enhancement queue for studio headshots",
    long_about = "
Headshot Processor

Queues freshly captured photos and turns each one into framed, enhanced
outputs: a 4:5 portrait and a 1:1 square, each optionally with the background
removed. Jobs are persisted, retried with exponential backoff and processed
one at a time.

Example Usage:
  # Queue a shoot folder
  headshot-processor enqueue ~/Shoots/2025-01-01 -o ~/Delivered --group 20250101-001

  # Process the queue with medium face enhancement and a white backdrop
  REPLICATE_API_TOKEN=r8_... headshot-processor run --face medium --background-color '#FFFFFF'

  # Inspect and retry failures
  headshot-processor failed
  headshot-processor retry --all
"
)]
pub struct Args {
    /// JSON configuration file
    #[arg(short = 'c', long = "config", global = true, value_name = "FILE")]
    pub config_file: Option<PathBuf>,

    /// Queue file (overrides the config file)
    #[arg(long, global = true, value_name = "FILE")]
    pub queue_file: Option<PathBuf>,

    /// Emit JSON lines on stdout instead of human output
    #[arg(long, global = true)]
    pub json: bool,

    /// Verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Add images (or folders of images) to the queue
    Enqueue(EnqueueArgs),
    /// Process pending jobs until the queue is idle
    Run(RunArgs),
    /// Show queue counts
    Status,
    /// List failed jobs
    Failed,
    /// Move failed jobs back to pending
    Retry {
        /// Job id to retry
        #[arg(required_unless_present = "all")]
        id: Option<String>,
        /// Retry every failed job
        #[arg(long, conflicts_with = "id")]
        all: bool,
    },
    /// Remove jobs from the queue
    Clear {
        /// Remove completed jobs only
        #[arg(long, conflicts_with = "include_failed")]
        completed: bool,
        /// Also remove failed jobs
        #[arg(long)]
        include_failed: bool,
    },
}

#[derive(ClapArgs, Debug)]
pub struct EnqueueArgs {
    /// Image files or directories
    #[arg(required = true, value_name = "PATH")]
    pub inputs: Vec<PathBuf>,

    /// Output folder for the finished images
    #[arg(short, long, value_name = "DIR")]
    pub output: PathBuf,

    /// Shoot identifier the jobs belong to
    #[arg(short, long, value_name = "LABEL")]
    pub group: String,

    /// Base name for outputs; numbered when several images are queued
    #[arg(short, long, value_name = "NAME")]
    pub name: Option<String>,

    /// Recurse into subdirectories
    #[arg(short, long)]
    pub recursive: bool,
}

#[derive(ClapArgs, Debug, Default)]
pub struct RunArgs {
    /// Inference service token
    #[arg(long, env = "REPLICATE_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,

    /// Face enhancement intensity
    #[arg(long, value_enum)]
    pub face: Option<Intensity>,

    /// Skin smoothing intensity
    #[arg(long, value_enum)]
    pub skin: Option<Intensity>,

    /// Upscale factor
    #[arg(long, value_enum)]
    pub upscale: Option<Upscale>,

    /// Skip the 4:5 portrait output
    #[arg(long)]
    pub no_portrait: bool,

    /// Skip the 1:1 square output
    #[arg(long)]
    pub no_square: bool,

    /// Keep the original background
    #[arg(long)]
    pub no_background_removal: bool,

    /// Solid color composited behind the cutout (#RGB or #RRGGBB)
    #[arg(long, value_name = "HEX")]
    pub background_color: Option<String>,

    /// Attempts before a job is marked failed
    #[arg(long)]
    pub max_retries: Option<u32>,
}
