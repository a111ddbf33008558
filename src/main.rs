use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod cmd;

#[derive(Parser)]
#[command(name = "phaser")]
#[command(version, about = "Turn a change plan into resumable, audited agent phases")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log output format (logs go to stderr)
    #[arg(long, value_enum, default_value = "text", global = true)]
    pub log_format: LogFormat,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Workspace root holding plans and phase state. Overrides phaser.toml.
    #[arg(long, global = true)]
    pub workspace: Option<PathBuf>,

    /// Model passed to the agent CLI. Overrides phaser.toml and PHASER_MODEL.
    #[arg(long, global = true)]
    pub model: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run phases of a plan until one does not complete
    Run {
        /// Plan file, or a plan name under <workspace>/plans
        plan: String,

        /// Stop after this many phases
        #[arg(long)]
        max_phases: Option<usize>,

        /// Fix-loop attempt budget for failing audits
        #[arg(long)]
        fix_attempts: Option<u32>,
    },
    /// Show the phases of a plan and their status
    Status {
        plan: String,

        /// Print the stored phase state as JSON
        #[arg(long)]
        json: bool,
    },
    /// Decompose a plan into phases without running them
    Decompose {
        plan: String,

        /// Replace existing phase state with a fresh decomposition
        #[arg(long)]
        force: bool,
    },
    /// Mark a phase as skipped
    Skip { plan: String, phase: String },
    /// View or initialize configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Write a default phaser.toml
    Init,
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if verbose { "phaser=debug" } else { "phaser=info" }));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    // A second initialization (tests, embedding) is harmless
    let _ = match format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Run {
            plan,
            max_phases,
            fix_attempts,
        } => cmd::cmd_run(&cli, &project_dir, plan, *max_phases, *fix_attempts).await?,
        Commands::Status { plan, json } => cmd::cmd_status(&cli, &project_dir, plan, *json)?,
        Commands::Decompose { plan, force } => cmd::cmd_decompose(&cli, &project_dir, plan, *force).await?,
        Commands::Skip { plan, phase } => cmd::cmd_skip(&cli, &project_dir, plan, phase).await?,
        Commands::Config { command } => cmd::cmd_config(&cli, &project_dir, command.clone())?,
    }

    Ok(())
}
