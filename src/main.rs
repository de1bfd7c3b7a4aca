use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use pipewatch::config::PipewatchConfig;
use pipewatch::logging;

mod cmd;

#[derive(Parser)]
#[command(name = "pipewatch")]
#[command(
    version,
    about = "Trigger a CI workflow, wait for one stage, and deliver its report"
)]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project directory holding .pipewatch/ and the artifact files (defaults to cwd)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Trigger a run for a branch, wait for the target stage, deliver its report
    Run {
        /// Branch or ref to run the workflow on
        reference: String,
        /// Stage (job name) to wait for. Overrides [poll] target_stage.
        #[arg(long)]
        stage: Option<String>,
        /// Stage status checks before giving up. Overrides [poll] max_retries.
        #[arg(long)]
        max_retries: Option<u32>,
        /// Print the report to stdout instead of posting to the webhook
        #[arg(long)]
        stdout: bool,
    },
    /// Trigger a run and exit
    Trigger {
        /// Branch or ref to run the workflow on
        reference: String,
    },
    /// Show a run's status and its stages
    Status {
        /// Numeric workflow run id
        run_id: u64,
        /// Stage to highlight. Overrides [poll] target_stage.
        #[arg(long)]
        stage: Option<String>,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default pipewatch.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let dotenv = dotenvy::dotenv();

    let (stage, max_retries) = match &cli.command {
        Commands::Run {
            stage, max_retries, ..
        } => (stage.clone(), *max_retries),
        Commands::Status { stage, .. } => (stage.clone(), None),
        _ => (None, None),
    };
    let config = PipewatchConfig::with_cli_args(project_dir.clone(), cli.verbose, stage, max_retries);

    let log_dir = config.as_ref().ok().and_then(|c| c.log_dir());
    let _log_guard = logging::init_tracing(cli.verbose, log_dir.as_deref())?;

    if let Err(e) = dotenv
        && !e.not_found()
    {
        tracing::warn!(error = %e, "could not load .env");
    }

    match &cli.command {
        Commands::Run {
            reference, stdout, ..
        } => cmd::cmd_run(&config?, reference, *stdout).await?,
        Commands::Trigger { reference } => cmd::cmd_trigger(&config?, reference).await?,
        Commands::Status { run_id, .. } => cmd::cmd_status(&config?, *run_id).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
