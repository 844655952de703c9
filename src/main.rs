//! `gazecode` CLI - Sparse event coding for eye-tracking recordings

mod cmd;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use gazecode::detect::SeenCodesPolicy;
use gazecode::{EventMode, SessionConfig};

#[derive(Parser)]
#[command(name = "gazecode")]
#[command(about = "Detect activity events in eye-tracking recordings with a vision model")]
#[command(version)]
struct Cli {
    /// Config file (default: ~/.config/gazecode/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging (`RUST_LOG` takes precedence)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect events in a recording and write custom_events.csv
    Run(RunArgs),

    /// Merge gaze with the scene video and render the gaze overlay video
    Render {
        /// Recording directory
        recording: PathBuf,
    },

    /// Decode a video into a frame table and per-frame JPEGs
    Frames {
        /// Video file to decode
        video: PathBuf,

        /// Output directory (default: <VIDEO stem>_frames next to the video)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
}

#[derive(Args)]
pub struct RunArgs {
    /// Recording directory (scene video, gaze.csv, world_timestamps.csv)
    pub recording: PathBuf,

    /// Activity descriptions, separated by ';'
    #[arg(short, long)]
    pub descriptions: Option<String>,

    /// Activity codes, separated by ';' (one per description)
    #[arg(long)]
    pub codes: Option<String>,

    /// How detections become events
    #[arg(short, long, value_enum)]
    pub mode: Option<ModeArg>,

    /// Cloud workspace id
    #[arg(short, long)]
    pub workspace: Option<String>,

    /// Cloud recording id
    #[arg(long)]
    pub recording_id: Option<String>,

    /// Frames per independently searched batch
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Ignore frames before this many seconds
    #[arg(long)]
    pub start: Option<f64>,

    /// Ignore frames after this many seconds
    #[arg(long)]
    pub end: Option<f64>,

    /// Lifetime of the already-detected code set
    #[arg(long, value_enum)]
    pub seen_codes: Option<SeenCodesArg>,

    /// Oracle model name
    #[arg(long)]
    pub model: Option<String>,

    /// Don't send events to the cloud, only write the CSV
    #[arg(long)]
    pub dry_run: bool,

    /// Summary output format
    #[arg(short, long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum ModeArg {
    /// start_<code> / end_<code> pairs
    Paired,
    /// One event per code
    SingleShot,
}

impl From<ModeArg> for EventMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Paired => EventMode::Paired,
            ModeArg::SingleShot => EventMode::SingleShot,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum SeenCodesArg {
    PerBatch,
    Session,
}

impl From<SeenCodesArg> for SeenCodesPolicy {
    fn from(policy: SeenCodesArg) -> Self {
        match policy {
            SeenCodesArg::PerBatch => SeenCodesPolicy::PerBatch,
            SeenCodesArg::Session => SeenCodesPolicy::Session,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run(args) => {
            cmd::cmd_run(config, args).await?;
        }
        Commands::Render { recording } => {
            cmd::cmd_render(config, &recording).await?;
        }
        Commands::Frames { video, out } => {
            cmd::cmd_frames(config, &video, out.as_deref()).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<SessionConfig> {
    let mut config = match path {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SessionConfig::load_default().context("failed to load default config")?,
    };
    config.apply_env();
    Ok(config)
}
