use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "autopilot")]
#[command(version, about = "Drive a coding agent through every phase of a roadmap")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project root (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run (or resume) the phase lifecycle
    Run {
        /// Spec used to bootstrap the project when no roadmap exists yet
        #[arg(long)]
        spec: Option<PathBuf>,

        /// Phases to run: "3", "2,3.1" or "3+" for phase 3 onwards
        #[arg(short, long)]
        phase: Option<String>,

        /// Replace the discuss step with a context document leaving decisions to the agent
        #[arg(long)]
        skip_discuss: bool,

        /// Skip verification and gap remediation
        #[arg(long)]
        skip_verify: bool,

        /// Per-step timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// No progress display and no interactive answers
        #[arg(long)]
        headless: bool,
    },
    /// Show where a run stands and where it would resume
    Status,
    /// Delete saved run state
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// View or create configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show file and effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default autopilot.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            spec,
            phase,
            skip_discuss,
            skip_verify,
            timeout,
            headless,
        } => {
            let args = cmd::RunArgs {
                spec: spec.clone(),
                phase: phase.clone(),
                skip_discuss: *skip_discuss,
                skip_verify: *skip_verify,
                timeout: *timeout,
                headless: *headless,
            };
            return cmd::cmd_run(&cli, &project_dir, args).await;
        }
        Commands::Status => cmd::cmd_status(&project_dir)?,
        Commands::Reset { force } => cmd::cmd_reset(&project_dir, *force)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(ExitCode::SUCCESS)
}
