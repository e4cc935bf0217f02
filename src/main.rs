use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use refinery_core::config::AppConfig;
use refinery_engine::WorkflowRuntime;
use refinery_gateway::GatewayServer;
use refinery_store::SqliteStore;

#[derive(Parser)]
#[command(name = "refinery", version, about = "Agent-graph document refinement engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "refinery.toml", env = "REFINERY_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upsert the agents and connections listed in the config file
    Seed,
    /// List agents
    Agents {
        /// Include inactive agents
        #[arg(long)]
        all: bool,
    },
    /// Print the graph view as JSON
    Graph {
        /// Include inactive agents and connections
        #[arg(long)]
        all: bool,
    },
    /// Connect two agents (ids or names)
    Connect { source: String, target: String },
    /// Delete a connection by id
    Disconnect { id: String },
    /// Refine a document and wait for the execution to finish
    Run {
        /// File holding the document text
        file: PathBuf,
        /// Document reference stored with the execution (defaults to the file name)
        #[arg(long)]
        cv_id: Option<String>,
        /// Seconds to wait before giving up on the execution
        #[arg(long, default_value_t = 600)]
        timeout: u64,
    },
    /// Show execution status and progress
    Status { id: String },
    /// Cancel a pending or running execution
    Cancel { id: String },
    /// Run the worker pool and the HTTP gateway
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("refinery=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let store_path = config.store_path();
    let store = Arc::new(
        SqliteStore::open(&store_path)
            .with_context(|| format!("opening store at {}", store_path.display()))?,
    );
    let processor = refinery_llm::create_processor(&config.processor);
    let mut runtime = WorkflowRuntime::new(config.clone(), store, processor);
    let service = runtime.service();

    match cli.command {
        Commands::Seed => {
            let report = service.seed(&config).await?;
            println!(
                "Seeded {} agents, {} connections ({} already present)",
                report.agents, report.connections, report.skipped_connections
            );
        }
        Commands::Agents { all } => {
            for agent in service.list_agents(!all).await? {
                println!(
                    "{:<38} {:<20} {:>4}  {}{}",
                    agent.id,
                    agent.name,
                    agent.order,
                    agent.display_name,
                    if agent.is_active { "" } else { " (inactive)" }
                );
            }
        }
        Commands::Graph { all } => {
            let graph = service.graph(all).await?;
            println!("{}", serde_json::to_string_pretty(&graph)?);
        }
        Commands::Connect { source, target } => {
            let connection = service.create_connection(&source, &target).await?;
            println!("{}", connection.id);
        }
        Commands::Disconnect { id } => {
            if !service.delete_connection(&id).await? {
                anyhow::bail!("connection {id} not found");
            }
        }
        Commands::Run {
            file,
            cv_id,
            timeout,
        } => {
            let document = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let cv_id = cv_id.unwrap_or_else(|| {
                file.file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "document".to_string())
            });

            runtime.start();
            let execution_id = service.start(&cv_id, &document).await?;
            let report = runtime
                .wait_for(&execution_id, Duration::from_secs(timeout))
                .await?;
            runtime.shutdown().await;

            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.status.is_terminal() {
                anyhow::bail!("execution {execution_id} still {}", report.status);
            }
        }
        Commands::Status { id } => {
            let report = service.status(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Cancel { id } => {
            let report = service.cancel(&id).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Serve => {
            runtime.start();
            let server = GatewayServer::new(config.gateway.clone(), service);

            let cancel = CancellationToken::new();
            let cancel_clone = cancel.clone();
            tokio::spawn(async move {
                tokio::signal::ctrl_c().await.ok();
                info!("Shutting down...");
                cancel_clone.cancel();
            });

            server.run(cancel).await?;
            runtime.shutdown().await;
        }
    }

    Ok(())
}

/// Load the given config file, falling back to `~/.refinery/config.toml` and
/// then to defaults with the API key taken from the environment.
fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        return Ok(AppConfig::load(path)?);
    }

    if let Some(home_config) = dirs_home().map(|h| h.join(".refinery").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(AppConfig::load(&home_config)?);
        }
    }

    eprintln!(
        "Warning: No config file found at {}. Using defaults.",
        path.display()
    );
    let mut config = AppConfig::default();
    config.processor.api_key = std::env::var("OPENAI_API_KEY").ok();
    Ok(config)
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
