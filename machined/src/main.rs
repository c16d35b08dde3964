use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use machined_backend::{MachineDirs, MachineRegistry};

mod routes;
mod server;

#[derive(Parser)]
#[command(name = "machined")]
#[command(about = "A daemon managing the lifecycle of local QEMU/KVM machines")]
#[command(version)]
struct Cli {
    /// Override the per-user config/data/state roots with one directory
    #[arg(long)]
    root: Option<PathBuf>,

    /// Listen on this UNIX socket instead of the default location
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigint = signal(SignalKind::interrupt()).expect("sigint");
    let mut sigterm = signal(SignalKind::terminate()).expect("sigterm");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {},
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let dirs = match &cli.root {
        Some(root) => MachineDirs::with_root(root),
        None => MachineDirs::new().context("failed to resolve machined directories")?,
    };
    let socket_path = cli.socket.unwrap_or_else(|| dirs.api_socket_path());

    let registry = Arc::new(MachineRegistry::new(dirs));
    registry
        .load_machines()
        .await
        .context("failed to load persisted machines")?;

    server::serve(Arc::clone(&registry), &socket_path, wait_for_signal()).await?;

    tracing::info!("shutting down, stopping all machines");
    registry.stop_all().await;
    let _ = std::fs::remove_file(&socket_path);
    Ok(())
}
