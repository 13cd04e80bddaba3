//! filing-harvest: resumable, incremental batch harvester for published
//! entity feeds and their filed documents.

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use filing_harvest::config::{Config, LogFormat};
use std::path::PathBuf;
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "filing-harvest")]
#[command(about = "Resumable, incremental harvester for entity feeds and their documents")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline
    Run {
        /// Reuse existing stage outputs and skip completed work
        #[arg(short, long)]
        resume: bool,

        /// Only process entities new or changed since the baseline
        #[arg(short, long)]
        incremental: bool,

        /// Baseline file for incremental runs
        #[arg(short, long)]
        baseline: Option<PathBuf>,

        /// Stop after this many entities
        #[arg(short, long)]
        limit: Option<u64>,

        /// Date token used in output file names (default: today, UTC)
        #[arg(long)]
        date_token: Option<String>,

        /// Local feed file instead of downloading it
        #[arg(long)]
        feed: Option<PathBuf>,

        /// Output directory
        #[arg(short, long)]
        output_dir: Option<PathBuf>,

        /// Suppress progress bars
        #[arg(short, long)]
        quiet: bool,
    },

    /// Show what a resumed run would find
    Status {
        /// Date token of the run to inspect (default: today, UTC)
        #[arg(long)]
        date_token: Option<String>,

        /// Inspect the incremental run
        #[arg(short, long)]
        incremental: bool,

        /// Output format (json, text)
        #[arg(short, long, default_value = "text")]
        format: String,
    },

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config is read first so its logging section applies
    let config = if cli.config.exists() {
        Config::read(&cli.config)?
    } else {
        Config::default()
    };

    let level = config.logging.level.raised_by(cli.verbose).to_tracing();
    match config.logging.format {
        LogFormat::Text => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .with_target(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        LogFormat::Json => {
            let subscriber = FmtSubscriber::builder()
                .with_max_level(level)
                .json()
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }

    match cli.command {
        Commands::Run {
            resume,
            incremental,
            baseline,
            limit,
            date_token,
            feed,
            output_dir,
            quiet,
        } => {
            let overrides = commands::run::RunOverrides {
                resume,
                incremental,
                baseline,
                limit,
                date_token,
                feed,
                output_dir,
            };
            commands::run::run_pipeline(config, overrides, quiet).await
        }
        Commands::Status {
            date_token,
            incremental,
            format,
        } => commands::status::show_status(config, date_token, incremental, &format),
        Commands::Init { path, force } => commands::init::init_config(path, force),
    }
}
