use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand};

use mcp_jobs::api::{self, AppState};
use mcp_jobs::auth::GoogleOAuth;
use mcp_jobs::config::Config;
use mcp_jobs::llm::create_provider;
use mcp_jobs::queue::worker::{ProviderFactory, WorkerSettings};
use mcp_jobs::queue::{ChildWorker, Supervisor, WorkerExit, run_retention_sweep};
use mcp_jobs::store::{Database, LibSqlBackend};

#[derive(Parser)]
#[command(name = "mcp-jobs", version, about = "Queued LLM agent jobs over an MCP toolkit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP API.
    Serve,
    /// Run the worker pool.
    Worker {
        /// Run as a single pool member (started by the supervisor).
        #[arg(long)]
        child: bool,
        #[arg(long, default_value_t = 0)]
        slot: usize,
    },
    /// Delete job records past the retention horizon, once.
    Sweep,
    /// Create or migrate the database schema.
    InitDb,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env().context("load configuration")?;

    match cli.command {
        Command::Worker { child: true, slot } => run_child_worker(config, slot),
        command => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("build runtime")?;
            rt.block_on(run(command, config))
        }
    }
}

async fn run(command: Command, config: Config) -> anyhow::Result<()> {
    let db = open_db(&config.database_path).await?;
    match command {
        Command::Serve => {
            let oauth = Arc::new(GoogleOAuth::new(&config.oauth));
            let state = AppState::new(db, oauth, &config);
            api::serve(&config.api.host, config.api.port, state)
                .await
                .context("API server")?;
        }
        Command::Worker { .. } => {
            let exe = std::env::current_exe().context("locate worker binary")?;
            Supervisor::new(exe, config.queue.clone(), db).run().await?;
        }
        Command::Sweep => {
            let report = run_retention_sweep(db.as_ref(), config.queue.retention_days, Utc::now())
                .await?;
            tracing::info!(
                jobs_deleted = report.jobs_deleted,
                results_purged = report.results_purged,
                "Sweep finished"
            );
        }
        Command::InitDb => {
            tracing::info!(path = %config.database_path.display(), "Database schema is current");
        }
    }
    Ok(())
}

/// One pool member. Store I/O runs on a current-thread control runtime;
/// each job gets its own runtime inside the worker.
fn run_child_worker(config: Config, slot: usize) -> anyhow::Result<()> {
    let control = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build control runtime")?;
    let db = control.block_on(open_db(&config.database_path))?;

    let llm = config.llm.clone();
    let factory: ProviderFactory = Arc::new(move || create_provider(&llm));
    let worker = ChildWorker::new(slot, db, WorkerSettings::from_config(&config), factory);

    match worker.run(&control)? {
        WorkerExit::Recycle | WorkerExit::Shutdown => Ok(()),
    }
}

async fn open_db(path: &Path) -> anyhow::Result<Arc<dyn Database>> {
    let db = LibSqlBackend::new_local(path)
        .await
        .with_context(|| format!("open database at {}", path.display()))?;
    Ok(Arc::new(db))
}
