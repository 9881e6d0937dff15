//! cutoverd — the cutover daemon.
//!
//! Loads a `cutover.toml`, assembles the pipeline and its deployment
//! groups, and serves the REST API that triggers runs, delivers approvals
//! and aborts deployments.
//!
//! # Usage
//!
//! ```text
//! cutoverd init --name shop --repository https://git.example.com/shop.git
//! cutoverd validate --config cutover.toml
//! cutoverd serve --config cutover.toml --port 8480 --data-dir /var/lib/cutover
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use cutover_core::CutoverConfig;
use cutover_pipeline::FsBlobStore;
use cutover_state::StateStore;
use cutoverd::{Wiring, assemble, check_strategies, http_health};

#[derive(Parser)]
#[command(name = "cutoverd", about = "cutover daemon")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline and serve the API.
    Serve {
        /// Path to cutover.toml.
        #[arg(long, default_value = "cutover.toml")]
        config: PathBuf,

        /// Port to listen on.
        #[arg(long, default_value = "8480")]
        port: u16,

        /// Data directory for the state store and artifact payloads.
        #[arg(long, default_value = "/var/lib/cutover")]
        data_dir: PathBuf,

        /// Directory build commands run in.
        #[arg(long)]
        workspace: Option<PathBuf>,
    },

    /// Check a configuration without serving.
    Validate {
        #[arg(long, default_value = "cutover.toml")]
        config: PathBuf,
    },

    /// Write a starter cutover.toml.
    Init {
        /// Pipeline name.
        #[arg(long)]
        name: String,

        /// Source repository URL.
        #[arg(long)]
        repository: String,

        #[arg(long, default_value = "cutover.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,cutover=debug")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            config,
            port,
            data_dir,
            workspace,
        } => serve(config, port, data_dir, workspace).await,
        Command::Validate { config } => validate(config),
        Command::Init {
            name,
            repository,
            output,
        } => init(&name, &repository, output),
    }
}

async fn serve(
    config_path: PathBuf,
    port: u16,
    data_dir: PathBuf,
    workspace: Option<PathBuf>,
) -> anyhow::Result<()> {
    let config = CutoverConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    info!(
        path = %config_path.display(),
        repository = %config.pipeline.source.repository,
        branch = %config.pipeline.source.branch,
        "cutover daemon starting"
    );

    std::fs::create_dir_all(&data_dir)?;
    let db_path = data_dir.join("cutover.redb");

    // ── Initialize subsystems ──────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let blobs = FsBlobStore::open(&data_dir.join("artifacts")).await?;
    info!(root = ?blobs.root(), "artifact store opened");

    let assembly = assemble(
        &config,
        Wiring {
            state,
            blobs: Arc::new(blobs),
            health: http_health,
            workspace,
        },
    )
    .await?;

    // ── Start API server ───────────────────────────────────────

    let router = assembly.api_router();
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "failed to listen for shutdown signal");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await?;

    // In-flight deployments roll back before exit.
    for group in &assembly.groups {
        if let Some(record) = group.abort("daemon shutdown").await {
            if !record.phase.is_terminal() {
                info!(group = %group.name(), attempt = record.attempt, "waiting for rollback");
                if let Some(handle) = group.active().await {
                    handle.wait().await;
                }
            }
        }
    }

    info!("cutover daemon stopped");
    Ok(())
}

fn validate(config_path: PathBuf) -> anyhow::Result<()> {
    let config = CutoverConfig::from_file(&config_path)
        .with_context(|| format!("loading {}", config_path.display()))?;
    check_strategies(&config)?;

    println!(
        "{}: pipeline {} ({} stages, {} environments) from {}@{}",
        config_path.display(),
        config.pipeline.name,
        config.pipeline.stages.len(),
        config.environments.len(),
        config.pipeline.source.repository,
        config.pipeline.source.branch,
    );
    Ok(())
}

fn init(name: &str, repository: &str, output: PathBuf) -> anyhow::Result<()> {
    if output.exists() {
        anyhow::bail!("{} already exists", output.display());
    }
    let config = CutoverConfig::scaffold(name, repository);
    std::fs::write(&output, config.to_toml_string()?)?;
    println!("wrote {}", output.display());
    Ok(())
}
