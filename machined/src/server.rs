use std::future::Future;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use machined_backend::MachineRegistry;
use tokio::net::UnixListener;

use crate::routes;

/// Bind the control socket and serve the HTTP API until `shutdown`
/// resolves. A stale socket file from a previous run is unlinked first.
pub async fn serve(
    registry: Arc<MachineRegistry>,
    socket_path: &Path,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    if let Some(parent) = socket_path.parent() {
        create_dir_0755(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    if socket_path.exists() {
        std::fs::remove_file(socket_path)
            .with_context(|| format!("failed to unlink stale socket {}", socket_path.display()))?;
    }

    let listener = UnixListener::bind(socket_path)
        .with_context(|| format!("failed to bind {}", socket_path.display()))?;
    tracing::info!("machined service listening on {}", socket_path.display());

    let app = routes::router(registry);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("http server failed")?;
    Ok(())
}

#[cfg(unix)]
fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(dir)
}

#[cfg(not(unix))]
fn create_dir_0755(dir: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)
}
