use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use trunkline::config::TrunklineConfig;

mod cmd;

#[derive(Parser)]
#[command(name = "trunkline")]
#[command(version, about = "Sequential task queue and merge orchestrator for coding agents")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding `.trunkline/` (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Database path. Overrides trunkline.toml and TRUNKLINE_DB_PATH.
    #[arg(long, global = true)]
    pub db_path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create `.trunkline/` with a default trunkline.toml and database
    Init {
        /// Overwrite an existing trunkline.toml
        #[arg(long)]
        force: bool,
    },
    /// Run the HTTP/WebSocket server and execute queued tasks
    Serve {
        /// Port to serve on (defaults to [server].port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Bind on all interfaces with permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Register and list repositories
    Project {
        #[command(subcommand)]
        command: ProjectCommands,
    },
    /// Create and inspect tasks
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Inspect and edit a project's sequential queue
    Queue {
        #[command(subcommand)]
        command: QueueCommands,
    },
}

#[derive(Subcommand)]
pub enum ProjectCommands {
    /// Register a git checkout as a project
    Add {
        name: String,
        /// Repository path (defaults to the project directory)
        #[arg(long)]
        path: Option<PathBuf>,
        /// Default target branch (defaults to the checkout's current branch)
        #[arg(long)]
        branch: Option<String>,
    },
    List,
}

#[derive(Subcommand)]
pub enum TaskCommands {
    /// Create a task. Sequential tasks join the tail of the queue.
    Add {
        #[arg(long)]
        project: i64,
        title: String,
        #[arg(short, long, default_value = "")]
        description: String,
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        target_branch: Option<String>,
    },
    /// Show a task and its attempts
    Show { id: i64 },
}

#[derive(Subcommand)]
pub enum QueueCommands {
    /// Pending tasks in run order
    List {
        #[arg(long)]
        project: i64,
        /// Include running and in-review tasks that still hold a position
        #[arg(long)]
        history: bool,
    },
    Enqueue { task: i64 },
    Dequeue { task: i64 },
    /// Move a pending task to a 0-based index
    Reorder { task: i64, index: usize },
    /// Clear a halted queue. The head starts on the next `trunkline serve`
    /// start or a POST to /api/projects/{id}/queue/resume
    Resume {
        #[arg(long)]
        project: i64,
    },
    /// Send a failed or cancelled task back to the tail and clear the halt.
    /// The head starts on the next `trunkline serve` start or a POST to
    /// /api/projects/{id}/queue/resume
    Requeue { task: i64 },
}

fn init_tracing(verbose: bool) {
    let log_level = if verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("trunkline={},warn", log_level).into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let mut config = TrunklineConfig::new(project_dir)?;
    if let Some(db_path) = cli.db_path.clone() {
        config.toml.server.db_path = Some(db_path);
    }

    match cli.command {
        Commands::Init { force } => cmd::cmd_init(&config, force)?,
        Commands::Serve { port, dev } => cmd::cmd_serve(&config, port, dev).await?,
        Commands::Project { command } => cmd::cmd_project(&config, command).await?,
        Commands::Task { command } => cmd::cmd_task(&config, command).await?,
        Commands::Queue { command } => cmd::cmd_queue(&config, command).await?,
    }

    Ok(())
}
