use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use dagrun::cli;
use dagrun::config::Config;
use dagrun::git::find_git_root;

#[derive(Parser)]
#[command(name = "dagrun")]
#[command(about = "DAG workflows of coding work in isolated git worktrees")]
#[command(version)]
struct Cli {
    /// Path to the repository (defaults to current directory)
    #[arg(short, long, global = true)]
    path: Option<PathBuf>,

    /// Path to the config file (defaults to .dagrun/config.toml in repo root)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage plans
    Plan {
        #[command(subcommand)]
        command: PlanCommands,
    },
    /// Inspect and retry individual nodes
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Run the local control server
    Serve {
        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,
    },
}

#[derive(Subcommand)]
enum PlanCommands {
    /// Create a plan from a JSON spec file
    Create {
        /// Path to the plan spec
        #[arg(long)]
        file: PathBuf,
        /// Run the plan immediately
        #[arg(long)]
        start: bool,
    },
    /// Start a plan and wait for completion
    Run { id: String },
    /// List known plans
    List {
        /// Filter by status (pending|running|paused|succeeded|failed|partial|canceled)
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Show a plan and its nodes
    Status {
        id: String,
        #[arg(long)]
        json: bool,
    },
    /// Pause scheduling for a plan
    Pause { id: String },
    /// Resume a paused plan
    Resume { id: String },
    /// Cancel every non-terminal node
    Cancel { id: String },
    /// Delete a plan and its artifacts
    Delete { id: String },
    /// Reset failed nodes and run again
    Retry { id: String },
}

#[derive(Subcommand)]
enum NodeCommands {
    /// Show one node's spec and execution state
    Details {
        plan_id: String,
        node_id: String,
        #[arg(long)]
        json: bool,
    },
    /// Show a node's execution log
    Logs {
        plan_id: String,
        node_id: String,
        /// Only the last N entries
        #[arg(long)]
        tail: Option<usize>,
    },
    /// Reset one node for retry
    Retry { plan_id: String, node_id: String },
    /// Import a workspace file as a node's phase spec
    ImportSpec {
        plan_id: String,
        node_id: String,
        /// File inside the workspace to read the spec from
        #[arg(long)]
        file: PathBuf,
        /// Phase to replace (work|prechecks|postchecks)
        #[arg(long, default_value = "work")]
        phase: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();

    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .init();

    let cwd = args.path.unwrap_or_else(|| PathBuf::from("."));
    let repo_path = find_git_root(&cwd).unwrap_or(cwd);
    let runner = cli::open_runner(&repo_path, args.config.as_deref()).await?;

    match args.command {
        Commands::Plan { command } => match command {
            PlanCommands::Create { file, start } => cli::plan::create(&runner, &file, start).await,
            PlanCommands::Run { id } => cli::plan::run(&runner, &id).await,
            PlanCommands::List { status, json } => {
                cli::plan::list(&runner, status.as_deref(), json).await
            }
            PlanCommands::Status { id, json } => cli::plan::status(&runner, &id, json).await,
            PlanCommands::Pause { id } => cli::plan::pause(&runner, &id).await,
            PlanCommands::Resume { id } => cli::plan::resume(&runner, &id).await,
            PlanCommands::Cancel { id } => cli::plan::cancel(&runner, &id).await,
            PlanCommands::Delete { id } => cli::plan::delete(&runner, &id).await,
            PlanCommands::Retry { id } => cli::plan::retry(&runner, &id).await,
        },
        Commands::Node { command } => match command {
            NodeCommands::Details {
                plan_id,
                node_id,
                json,
            } => cli::node::details(&runner, &plan_id, &node_id, json).await,
            NodeCommands::Logs {
                plan_id,
                node_id,
                tail,
            } => cli::node::logs(&runner, &plan_id, &node_id, tail).await,
            NodeCommands::Retry { plan_id, node_id } => {
                cli::node::retry(&runner, &plan_id, &node_id).await
            }
            NodeCommands::ImportSpec {
                plan_id,
                node_id,
                file,
                phase,
            } => cli::node::import_spec(&runner, &plan_id, &node_id, &phase, &file).await,
        },
        Commands::Serve { port } => {
            let config = Config::load(&repo_path, args.config.as_deref())?;
            let port = port.unwrap_or(config.settings.http_port);
            cli::serve::serve(runner, port).await
        }
    }
}
