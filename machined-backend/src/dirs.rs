use std::path::{Path, PathBuf};

use directories::ProjectDirs;

use crate::error::{Error, Result};

// Constant path components shared across the daemon
const MACHINES_DIR: &str = "machines";
const CONFIG_FILENAME: &str = "machine.yaml";
const SOCKET_FILENAME: &str = "machine.socket";
pub(crate) const QMP_SOCKET: &str = "qmp.sock";
pub(crate) const MONITOR_SOCKET: &str = "monitor.sock";
pub(crate) const CONSOLE_SOCKET: &str = "console.sock";
pub(crate) const UEFI_VARS_FILENAME: &str = "uefi_vars.fd";

/// Per-user directory layout for machined.
///
/// Every machine owns one directory under each root:
/// - `<config-root>/machines/<name>/machine.yaml` — persisted definition
/// - `<data-root>/machines/<name>/` — images and persistent artifacts
/// - `<state-root>/machines/<name>/` — run directory: control sockets,
///   NVRAM copy, imported images
#[derive(Debug, Clone)]
pub struct MachineDirs {
    config_root: PathBuf,
    data_root: PathBuf,
    state_root: PathBuf,
}

impl MachineDirs {
    /// Resolve the standard per-user roots (XDG on Linux).
    pub fn new() -> Result<Self> {
        let project_dirs = ProjectDirs::from("", "", "machined").ok_or_else(|| {
            Error::io(
                "machined",
                std::io::Error::other("failed to determine project directories"),
            )
        })?;

        Ok(Self {
            config_root: project_dirs.config_dir().to_path_buf(),
            data_root: project_dirs.data_dir().to_path_buf(),
            state_root: project_dirs
                .state_dir()
                .unwrap_or(project_dirs.data_dir())
                .to_path_buf(),
        })
    }

    /// Pin all three roots under a single directory. Used by tests and the
    /// daemon's `--root` flag.
    #[must_use]
    pub fn with_root(root: &Path) -> Self {
        Self {
            config_root: root.join("config"),
            data_root: root.join("data"),
            state_root: root.join("state"),
        }
    }

    /// `<data-root>/machine.socket` — the daemon's HTTP control socket.
    #[must_use]
    pub fn api_socket_path(&self) -> PathBuf {
        self.data_root.join(SOCKET_FILENAME)
    }

    /// `<config-root>/machines` — parent of all persisted definitions.
    #[must_use]
    pub fn machines_config_root(&self) -> PathBuf {
        self.config_root.join(MACHINES_DIR)
    }

    #[must_use]
    pub fn machine_config_dir(&self, name: &str) -> PathBuf {
        self.machines_config_root().join(name)
    }

    #[must_use]
    pub fn machine_data_dir(&self, name: &str) -> PathBuf {
        self.data_root.join(MACHINES_DIR).join(name)
    }

    /// The machine's run directory.
    #[must_use]
    pub fn machine_state_dir(&self, name: &str) -> PathBuf {
        self.state_root.join(MACHINES_DIR).join(name)
    }

    #[must_use]
    pub fn machine_config_file(&self, name: &str) -> PathBuf {
        self.machine_config_dir(name).join(CONFIG_FILENAME)
    }

    #[must_use]
    pub fn machine_qmp_socket(&self, name: &str) -> PathBuf {
        self.machine_state_dir(name).join(QMP_SOCKET)
    }

    #[must_use]
    pub fn machine_monitor_socket(&self, name: &str) -> PathBuf {
        self.machine_state_dir(name).join(MONITOR_SOCKET)
    }

    #[must_use]
    pub fn machine_console_socket(&self, name: &str) -> PathBuf {
        self.machine_state_dir(name).join(CONSOLE_SOCKET)
    }

    #[must_use]
    pub fn machine_uefi_vars(&self, name: &str) -> PathBuf {
        self.machine_state_dir(name).join(UEFI_VARS_FILENAME)
    }

    /// Ensure a directory exists, creating it and all parents if necessary.
    pub async fn ensure_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path)
            .await
            .map_err(|e| Error::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn per_machine_layout_hangs_off_the_three_roots() {
        let dirs = MachineDirs::with_root(Path::new("/srv/md"));
        assert_eq!(
            dirs.machine_config_file("alpha"),
            PathBuf::from("/srv/md/config/machines/alpha/machine.yaml")
        );
        assert_eq!(
            dirs.machine_data_dir("alpha"),
            PathBuf::from("/srv/md/data/machines/alpha")
        );
        assert_eq!(
            dirs.machine_qmp_socket("alpha"),
            PathBuf::from("/srv/md/state/machines/alpha/qmp.sock")
        );
        assert_eq!(
            dirs.machine_console_socket("alpha"),
            PathBuf::from("/srv/md/state/machines/alpha/console.sock")
        );
    }

    #[test]
    fn api_socket_lives_under_the_data_root() {
        let dirs = MachineDirs::with_root(Path::new("/srv/md"));
        assert_eq!(
            dirs.api_socket_path(),
            PathBuf::from("/srv/md/data/machine.socket")
        );
    }
}
