use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use machined_def::VmDef;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::args::build_qemu_args;
use crate::config::{synthesize_config, Config, QemuPaths};
use crate::error::{Error, Result};
use crate::qmp::QmpClient;

const SOCKET_WAIT_ATTEMPTS: u32 = 10;
const SOCKET_POLL_INTERVAL: Duration = Duration::from_secs(1);
const QMP_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const STOP_GRACE: Duration = Duration::from_secs(10);
const REAP_TIMEOUT: Duration = Duration::from_secs(10);

/// Supervisor state for one QEMU child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmState {
    Init,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
}

/// What the child-wait task observed when QEMU exited.
#[derive(Debug, Clone, Default)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub stderr: String,
}

/// Per-machine VM supervisor. Owns the QEMU child, its QMP session, and
/// the run directory contents for exactly one instantiation.
pub struct Vm {
    name: String,
    config: Config,
    argv: Vec<String>,
    state: VmState,
    cancel: CancellationToken,
    exit_rx: Option<watch::Receiver<Option<ExitReport>>>,
    qmp: Option<QmpClient>,
    qmp_closed: Option<oneshot::Receiver<()>>,
    instance_id: Uuid,
    // bounded waits, shortened by tests
    socket_wait_attempts: u32,
    socket_poll_interval: Duration,
}

impl Vm {
    /// Synthesize the config and argv for a definition. Side effects (run
    /// dir, disk import, NVRAM copy) happen here, before any spawn.
    pub async fn new(def: &VmDef, run_dir: &Path, paths: &QemuPaths) -> Result<Self> {
        let config = synthesize_config(def, run_dir, paths).await?;
        let argv = build_qemu_args(&config)?;
        Ok(Self {
            name: def.name.clone(),
            config,
            argv,
            state: VmState::Init,
            cancel: CancellationToken::new(),
            exit_rx: None,
            qmp: None,
            qmp_closed: None,
            instance_id: Uuid::new_v4(),
            socket_wait_attempts: SOCKET_WAIT_ATTEMPTS,
            socket_poll_interval: SOCKET_POLL_INTERVAL,
        })
    }

    #[must_use]
    pub const fn state(&self) -> VmState {
        self.state
    }

    #[must_use]
    pub const fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        matches!(self.state, VmState::Starting | VmState::Running)
    }

    /// Watch for the child's exit report. Available once started.
    #[must_use]
    pub fn exit_watch(&self) -> Option<watch::Receiver<Option<ExitReport>>> {
        self.exit_rx.clone()
    }

    /// One-shot fired when the QMP peer closes its socket.
    pub fn take_qmp_closed(&mut self) -> Option<oneshot::Receiver<()>> {
        self.qmp_closed.take()
    }

    /// Spawn QEMU, wait for its control sockets, and bring up QMP.
    pub async fn start(&mut self) -> Result<()> {
        self.state = VmState::Starting;
        tracing::info!(machine = %self.name, "starting VM");

        let up = async {
            self.spawn_child()?;
            self.wait_for_sockets().await?;
            self.connect_qmp().await
        }
        .await;

        match up {
            Ok(()) => {
                self.state = VmState::Running;
                tracing::info!(machine = %self.name, "VM running");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(machine = %self.name, error = %e, "VM start failed, tearing down");
                self.cancel.cancel();
                self.wait_for_exit(REAP_TIMEOUT).await;
                self.qmp = None;
                self.state = VmState::Failed;
                Err(e)
            }
        }
    }

    fn spawn_child(&mut self) -> Result<()> {
        tracing::debug!(
            machine = %self.name,
            "exec {} {}",
            self.config.binary.display(),
            self.argv.join(" ")
        );

        let mut child = Command::new(&self.config.binary)
            .args(&self.argv)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| Error::Spawn {
                stderr: format!("failed to spawn {}: {e}", self.config.binary.display()),
            })?;

        let stderr_pipe = child.stderr.take();
        let (exit_tx, exit_rx) = watch::channel(None);
        let cancel = self.cancel.clone();
        let name = self.name.clone();

        tokio::spawn(async move {
            // Drain stderr concurrently so a chatty child cannot stall on a
            // full pipe while we wait for it.
            let drain = tokio::spawn(async move {
                let mut buf = String::new();
                if let Some(mut pipe) = stderr_pipe {
                    let _ = pipe.read_to_string(&mut buf).await;
                }
                buf
            });

            let status = tokio::select! {
                status = child.wait() => status,
                () = cancel.cancelled() => {
                    tracing::warn!(machine = %name, "killing QEMU child");
                    let _ = child.start_kill();
                    child.wait().await
                }
            };

            let stderr = drain.await.unwrap_or_default();
            let code = status.ok().and_then(|s| s.code());
            tracing::info!(machine = %name, ?code, "QEMU process exited");
            let _ = exit_tx.send(Some(ExitReport { code, stderr }));
        });

        self.exit_rx = Some(exit_rx);
        Ok(())
    }

    /// Poll for the control sockets QEMU creates, failing early if the
    /// child already exited.
    async fn wait_for_sockets(&mut self) -> Result<()> {
        for socket in self.config.socket_paths() {
            let mut found = false;
            for _ in 0..self.socket_wait_attempts {
                if let Some(report) = self.exit_report() {
                    return Err(Error::Spawn {
                        stderr: report.stderr,
                    });
                }
                if tokio::fs::try_exists(&socket).await.unwrap_or(false) {
                    found = true;
                    break;
                }
                tokio::time::sleep(self.socket_poll_interval).await;
            }
            if !found {
                return Err(Error::Timeout {
                    op: format!("control socket {}", socket.display()),
                });
            }
        }
        Ok(())
    }

    async fn connect_qmp(&mut self) -> Result<()> {
        let (closed_tx, closed_rx) = oneshot::channel();
        let path = self.config.qmp.path.clone();
        let qmp = tokio::time::timeout(QMP_CONNECT_TIMEOUT, QmpClient::connect(&path, closed_tx))
            .await
            .map_err(|_| Error::Timeout {
                op: format!("QMP connect to {}", path.display()),
            })??;
        tracing::info!(machine = %self.name, qemu = %qmp.version(), "QMP session established");
        self.qmp = Some(qmp);
        self.qmp_closed = Some(closed_rx);
        Ok(())
    }

    /// Stop the VM. The graceful path asks the guest to power down and
    /// falls back to killing the child when the grace period elapses; the
    /// forced path kills immediately without touching QMP.
    pub async fn stop(&mut self, force: bool) -> Result<()> {
        if matches!(self.state, VmState::Stopped) {
            return Ok(());
        }
        self.state = VmState::Stopping;

        if force {
            tracing::info!(machine = %self.name, "force stopping VM");
            self.cancel.cancel();
            self.wait_for_exit(REAP_TIMEOUT).await;
        } else if let Some(qmp) = self.qmp.as_mut() {
            tracing::info!(
                machine = %self.name,
                "trying graceful shutdown via system_powerdown ({}s grace)",
                STOP_GRACE.as_secs()
            );
            if let Err(e) = qmp.system_powerdown().await {
                tracing::warn!(machine = %self.name, error = %e, "system_powerdown failed");
            }
            if self.wait_for_exit(STOP_GRACE).await {
                tracing::info!(machine = %self.name, "guest powered down");
            } else {
                tracing::warn!(machine = %self.name, "graceful window elapsed, cancelling");
                self.cancel.cancel();
                self.wait_for_exit(REAP_TIMEOUT).await;
            }
        } else {
            // no QMP session: nothing to ask, go straight to the kill path
            self.cancel.cancel();
            self.wait_for_exit(REAP_TIMEOUT).await;
        }

        self.qmp = None;
        self.qmp_closed = None;
        self.state = VmState::Stopped;
        tracing::info!(machine = %self.name, "VM stopped");
        Ok(())
    }

    fn exit_report(&self) -> Option<ExitReport> {
        self.exit_rx.as_ref().and_then(|rx| rx.borrow().clone())
    }

    /// Wait up to `timeout` for the child's exit report. True when the
    /// child is known to be gone (or was never spawned).
    async fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let Some(rx) = self.exit_rx.as_mut() else {
            return true;
        };
        if rx.borrow().is_some() {
            return true;
        }
        matches!(
            tokio::time::timeout(timeout, rx.changed()).await,
            Ok(Ok(()))
        )
    }
}
