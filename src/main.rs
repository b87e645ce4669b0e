use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "buildpilot")]
#[command(version, about = "Phase-execution control core for autonomous builds")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub yes: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Artifact root holding runs, locks and logs (defaults to <project-dir>/.buildpilot)
    #[arg(long, global = true, env = "BUILDPILOT_ROOT")]
    pub root: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a run from an intention anchor and a phase plan
    Init {
        #[arg(long)]
        run: String,
        /// Anchor file (.json, .yaml or .yml)
        #[arg(long)]
        anchor: PathBuf,
        /// Plan file listing the run's phases (.json, .yaml or .yml)
        #[arg(long)]
        plan: PathBuf,
    },
    /// Execute one attempt of a phase, with stuck handling
    Advance {
        #[arg(long)]
        run: String,
        #[arg(long)]
        phase: String,
        /// Print the step outcome as JSON
        #[arg(long)]
        json: bool,
    },
    /// Advance a phase (or every phase in order) until it stops
    Drive {
        #[arg(long)]
        run: String,
        /// Drive only this phase
        #[arg(long)]
        phase: Option<String>,
    },
    /// Show runs, or the phases of one run
    Status {
        #[arg(long)]
        run: Option<String>,
    },
    /// Print a run's replan and escalation counters
    Counters {
        #[arg(long)]
        run: String,
    },
    /// Show a run's usage totals and remaining budget
    Usage {
        #[arg(long)]
        run: String,
    },
    Anchor {
        #[command(subcommand)]
        command: AnchorCommands,
    },
    /// Inspect and manage subsystem leases
    Lock {
        #[command(subcommand)]
        command: LockCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum AnchorCommands {
    /// Parse and validate an anchor file
    Validate { path: PathBuf },
    /// Print the anchor stored for a run
    Show {
        #[arg(long)]
        run: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum LockCommands {
    /// Acquire a subsystem lease and print it
    Acquire {
        /// Subsystem name: queue, runs, archive or docs
        subsystem: String,
        #[arg(long)]
        owner: String,
        /// How long to wait for a held lease (defaults to locks.acquire_timeout_ms)
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Extend a lease held by --owner under --token
    Renew {
        subsystem: String,
        #[arg(long)]
        owner: String,
        #[arg(long)]
        token: String,
    },
    /// Release a lease
    Release {
        subsystem: String,
        #[arg(long)]
        owner: Option<String>,
        /// Remove the lease whoever holds it
        #[arg(long)]
        force: bool,
    },
    /// List all leases
    Status,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default buildpilot.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // These work without a resolved artifact root.
    match &cli.command {
        Commands::Config { command } => return cmd::cmd_config(&project_dir, command.clone()),
        Commands::Anchor {
            command: AnchorCommands::Validate { path },
        } => return cmd::cmd_anchor_validate(path),
        _ => {}
    }

    let config = buildpilot::config::Config::with_cli_args(
        project_dir,
        cli.root.clone(),
        cli.verbose,
        cli.yes,
    )?;
    let _logging = buildpilot::logging::init_logging(&config.log_dir(), cli.verbose)?;

    match &cli.command {
        Commands::Init { run, anchor, plan } => cmd::cmd_init(&config, run, anchor, plan)?,
        Commands::Advance { run, phase, json } => {
            cmd::cmd_advance(&config, run, phase, *json).await?
        }
        Commands::Drive { run, phase } => cmd::cmd_drive(&config, run, phase.as_deref()).await?,
        Commands::Status { run } => cmd::cmd_status(&config, run.as_deref())?,
        Commands::Counters { run } => cmd::cmd_counters(&config, run)?,
        Commands::Usage { run } => cmd::cmd_usage(&config, run)?,
        Commands::Anchor { command } => cmd::cmd_anchor(&config, command)?,
        Commands::Lock { command } => cmd::cmd_lock(&config, command)?,
        Commands::Config { .. } => {}
    }

    Ok(())
}
