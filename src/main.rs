//! Prospector kernel - main entry point.
//!
//! Opens the state store, resumes every running pipeline, starts the stall
//! watchdog and serves the IPC API until Ctrl-C.

use clap::Parser;
use prospector_core::ipc::IpcServer;
use prospector_core::orchestrator::{HttpTransport, Orchestrator};
use prospector_core::store::{MemoryStore, SqliteStore, StateStore};
use prospector_core::Config;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "prospector-kernel")]
#[command(version, about = "Lead-acquisition pipeline orchestrator")]
struct Cli {
    /// TOML config file. Defaults apply when omitted.
    #[arg(short, long, env = "PROSPECTOR_CONFIG")]
    config: Option<PathBuf>,

    /// IPC listen address (overrides config).
    #[arg(long)]
    listen: Option<String>,

    /// SQLite database path (overrides config).
    #[arg(long, conflicts_with = "in_memory")]
    db: Option<PathBuf>,

    /// Keep all state in memory; nothing survives a restart.
    #[arg(long)]
    in_memory: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => {
            let mut config = Config::default();
            config.apply_env_overrides();
            config
        }
    };
    if let Some(listen) = cli.listen {
        config.server.listen_addr = listen;
    }
    if let Some(db) = cli.db {
        config.store.path = Some(db);
    }
    if cli.in_memory {
        config.store.path = None;
    }

    prospector_core::observability::init_tracing(&config.observability);

    let store: Arc<dyn StateStore> = match &config.store.path {
        Some(path) => {
            tracing::info!("state_store_opened: backend=sqlite, path={}", path.display());
            Arc::new(SqliteStore::open(path)?)
        }
        None => {
            tracing::warn!("state_store_opened: backend=memory (state is lost on exit)");
            Arc::new(MemoryStore::new())
        }
    };
    let transport = Arc::new(HttpTransport::new(&config.executor)?);
    let orchestrator = Arc::new(Orchestrator::new(store, transport, &config));

    orchestrator.resume_all().await?;
    orchestrator.spawn_watchdog();

    let addr: SocketAddr = config.server.listen_addr.parse()?;
    let server = Arc::new(IpcServer::new(orchestrator.clone(), addr, config.ipc.clone()));

    let serving = {
        let server = server.clone();
        tokio::spawn(async move { server.serve().await })
    };

    tracing::info!(
        "prospector_kernel_started: listen_addr={}, executor={}",
        addr,
        config.executor.base_url
    );

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("shutdown_requested");
        }
        served = serving => {
            served??;
        }
    }

    server.shutdown();
    orchestrator.shutdown().await;
    tracing::info!("prospector_kernel_stopped");
    Ok(())
}
