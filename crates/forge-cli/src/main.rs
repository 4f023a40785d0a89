mod config;
mod init_cmd;
mod queue_cmd;
mod register_cmd;
mod serve_cmd;
mod sync_cmd;
mod taskdef;
mod tick_cmd;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "forge", about = "Coordination core for distributed task execution")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the coordinator HTTP server
    Serve {
        /// Bind address (overrides HOST env var)
        #[arg(long)]
        host: Option<String>,
        /// Port (overrides PORT env var)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Register this workspace with a coordinator
    Register {
        /// Display name for this workspace
        name: String,
        /// Coordinator URL
        #[arg(long, default_value = "http://localhost:3344")]
        url: String,
    },
    /// Reconcile local state with the coordinator
    Sync {
        /// What to reconcile
        #[arg(value_enum, default_value_t = SyncMode::Full)]
        mode: SyncMode,
    },
    /// Queue task definitions from .forge/tasks/
    QueueTasks {
        /// Queue every definition
        #[arg(long)]
        all: bool,
        /// Queue a single task by id
        #[arg(long)]
        task: Option<String>,
        /// Show what would be queued without doing it
        #[arg(long)]
        dry_run: bool,
    },
    /// Write a task definition for this workspace
    Init {
        /// The task prompt
        prompt: String,
        /// Completion criteria, e.g. "file-exists:OUT.txt" or "promise:DONE"
        #[arg(long = "until")]
        until: Vec<String>,
        /// Task name (defaults to a slug of the prompt)
        #[arg(long)]
        name: Option<String>,
    },
    /// Run one iteration tick against a transcript (parent-runtime hook)
    Tick {
        /// Path to the transcript file produced by the runtime
        #[arg(long)]
        transcript: std::path::PathBuf,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum SyncMode {
    Full,
    Push,
    Pull,
    Pending,
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { host, port } => serve_cmd::run_serve(host, port).await,
        Commands::Register { name, url } => register_cmd::run_register(&name, &url).await,
        Commands::Sync { mode } => sync_cmd::run_sync(mode).await,
        Commands::QueueTasks {
            all,
            task,
            dry_run,
        } => queue_cmd::run_queue_tasks(all, task.as_deref(), dry_run).await,
        Commands::Init { prompt, until, name } => {
            init_cmd::run_init(&prompt, &until, name.as_deref())
        }
        Commands::Tick { transcript } => tick_cmd::run_tick(&transcript).await,
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("forge=info")),
        )
        .init();

    if let Err(err) = run().await {
        eprintln!("Error: {err:#}");
        std::process::exit(1);
    }
}
