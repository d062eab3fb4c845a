use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use conveyor::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "conveyor")]
#[command(version, about = "Protocol orchestrator with a leased job queue and QA feedback loop")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Print command results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .conveyor/ with a default conveyor.toml and database
    Init {
        /// Overwrite an existing conveyor.toml
        #[arg(long)]
        force: bool,
    },
    /// Manage projects
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Create a protocol run from a plan file (TOML or JSON)
    Create {
        plan: PathBuf,
        /// Start the run right away
        #[arg(long)]
        start: bool,
    },
    /// List protocol runs
    List {
        /// Only runs with this status
        #[arg(long)]
        status: Option<String>,
    },
    /// Apply an operator action: start, pause, resume, cancel, run_next_step,
    /// retry_latest, run_qa, approve, open_pr
    Action {
        protocol: i64,
        action: conveyor::api::Action,
        /// Target step for run_qa and approve
        #[arg(long)]
        step: Option<i64>,
    },
    /// Answer a clarification
    Answer {
        clarification: i64,
        answer: String,
        #[arg(long)]
        by: Option<String>,
        /// Resume the blocked protocol once nothing else blocks it
        #[arg(long)]
        resume: bool,
    },
    /// Show a protocol run with its steps and jobs
    Status { protocol: i64 },
    /// Show the event log of a protocol run
    Events {
        protocol: i64,
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// List clarifications
    Clarifications {
        /// Only open clarifications
        #[arg(long)]
        open: bool,
        #[arg(long)]
        protocol: Option<i64>,
    },
    /// Run workers that claim and execute queued jobs
    Worker {
        /// Number of concurrent workers (defaults to worker.workers)
        #[arg(short, long)]
        workers: Option<usize>,
        /// Drain the queue once and exit
        #[arg(long)]
        once: bool,
    },
    /// Reclaim jobs whose lease expired
    Sweep,
    /// Re-derive stuck runs from their step states
    Recover {
        #[arg(long, default_value = "50")]
        limit: usize,
    },
    /// Show job counts per status
    Queue,
}

#[derive(Subcommand, Clone)]
pub enum ProjectCommands {
    /// Register a project
    Add {
        name: String,
        #[arg(long)]
        git_url: Option<String>,
        #[arg(long, default_value = "main")]
        base_branch: String,
    },
    /// List registered projects
    List,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and list any problems
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose, LogFormat::resolve(cli.json_logs));

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init { force } => cmd::cmd_init(&project_dir, *force)?,
        Commands::Project { command } => cmd::cmd_project(&project_dir, command.clone())?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
        Commands::Create { plan, start } => cmd::cmd_create(&project_dir, plan, *start, cli.json).await?,
        Commands::List { status } => cmd::cmd_list(&project_dir, status.as_deref(), cli.json)?,
        Commands::Action {
            protocol,
            action,
            step,
        } => cmd::cmd_action(&project_dir, *protocol, *action, *step, cli.json).await?,
        Commands::Answer {
            clarification,
            answer,
            by,
            resume,
        } => {
            cmd::cmd_answer(
                &project_dir,
                *clarification,
                answer.clone(),
                by.clone(),
                *resume,
                cli.json,
            )
            .await?
        }
        Commands::Status { protocol } => cmd::cmd_status(&project_dir, *protocol, cli.json)?,
        Commands::Events { protocol, limit } => cmd::cmd_events(&project_dir, *protocol, *limit, cli.json)?,
        Commands::Clarifications { open, protocol } => {
            cmd::cmd_clarifications(&project_dir, *protocol, *open, cli.json)?
        }
        Commands::Worker { workers, once } => cmd::cmd_worker(&project_dir, *workers, *once).await?,
        Commands::Sweep => cmd::cmd_sweep(&project_dir).await?,
        Commands::Recover { limit } => cmd::cmd_recover(&project_dir, *limit)?,
        Commands::Queue => cmd::cmd_queue(&project_dir, cli.json)?,
    }

    Ok(())
}
