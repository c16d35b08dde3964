use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use machined_def::VmDef;
use serde::{Deserialize, Serialize};

use crate::dirs::MachineDirs;
use crate::error::{Error, Result};
use crate::vm::Vm;

/// Machine lifecycle status as it appears on the wire and on disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MachineStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl MachineStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        }
    }
}

impl fmt::Display for MachineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The persisted and wire-visible form of a machine: everything except the
/// live supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MachineRecord {
    pub name: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,

    #[serde(default)]
    pub ephemeral: bool,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub status: MachineStatus,

    pub config: VmDef,
}

impl MachineRecord {
    #[must_use]
    pub fn new(def: VmDef, ephemeral: bool, description: String) -> Self {
        Self {
            name: def.name.clone(),
            description,
            ephemeral,
            created_at: Utc::now(),
            status: MachineStatus::Stopped,
            config: def,
        }
    }
}

/// A machine known to the registry: its record plus, while running, the
/// owning handle to its VM supervisor. The supervisor holds no
/// back-reference; outcomes flow back over channels.
pub struct Machine {
    pub record: MachineRecord,
    dirs: MachineDirs,
    pub instance: Option<Vm>,
}

impl Machine {
    #[must_use]
    pub fn new(record: MachineRecord, dirs: MachineDirs) -> Self {
        Self {
            record,
            dirs,
            instance: None,
        }
    }

    #[must_use]
    pub fn config_dir(&self) -> PathBuf {
        self.dirs.machine_config_dir(&self.record.name)
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        self.dirs.machine_data_dir(&self.record.name)
    }

    /// The run directory: control sockets, NVRAM copy, imported images.
    #[must_use]
    pub fn state_dir(&self) -> PathBuf {
        self.dirs.machine_state_dir(&self.record.name)
    }

    #[must_use]
    pub fn config_file(&self) -> PathBuf {
        self.dirs.machine_config_file(&self.record.name)
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.instance.is_some()
            && matches!(
                self.record.status,
                MachineStatus::Running | MachineStatus::Starting
            )
    }

    /// Persist the record to `machine.yaml`. Ephemeral machines are the
    /// caller's business; this always writes.
    pub async fn save(&self) -> Result<()> {
        let config_file = self.config_file();
        let config_dir = config_file
            .parent()
            .ok_or_else(|| Error::invalid("machine config file has no parent"))?;
        self.dirs.ensure_dir(config_dir).await?;

        let contents = serde_yaml::to_string(&self.record)?;
        tokio::fs::write(&config_file, contents)
            .await
            .map_err(|e| Error::io(&config_file, e))?;
        tracing::debug!(machine = %self.record.name, file = %config_file.display(), "saved record");
        Ok(())
    }

    /// Load a persisted record. Status always comes back `stopped`: a
    /// previously spawned QEMU is orphaned, never adopted.
    pub async fn load(config_file: &Path, dirs: MachineDirs) -> Result<Self> {
        let contents = tokio::fs::read_to_string(config_file)
            .await
            .map_err(|e| Error::io(config_file, e))?;
        let mut record: MachineRecord = serde_yaml::from_str(&contents)?;
        record.status = MachineStatus::Stopped;
        Ok(Self::new(record, dirs))
    }

    /// Remove the machine's three directories. Absent directories are fine;
    /// any other failure aborts so the operator can retry the delete.
    pub async fn remove_dirs(&self) -> Result<()> {
        for dir in [self.config_dir(), self.data_dir(), self.state_dir()] {
            match tokio::fs::remove_dir_all(&dir).await {
                Ok(()) => tracing::info!(machine = %self.record.name, dir = %dir.display(), "removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::io(&dir, e)),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> MachineRecord {
        MachineRecord::new(
            VmDef {
                name: name.to_string(),
                cpus: 2,
                ..VmDef::default()
            },
            false,
            "test machine".to_string(),
        )
    }

    #[tokio::test]
    async fn record_round_trips_through_machine_yaml() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = MachineDirs::with_root(tmp.path());
        let machine = Machine::new(record("alpha"), dirs.clone());

        machine.save().await.expect("save");
        assert!(machine.config_file().is_file());

        let loaded = Machine::load(&machine.config_file(), dirs)
            .await
            .expect("load");
        assert_eq!(loaded.record, machine.record);
    }

    #[tokio::test]
    async fn load_forces_status_to_stopped() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = MachineDirs::with_root(tmp.path());
        let mut machine = Machine::new(record("beta"), dirs.clone());
        machine.record.status = MachineStatus::Running;
        machine.save().await.expect("save");

        let loaded = Machine::load(&machine.config_file(), dirs)
            .await
            .expect("load");
        assert_eq!(loaded.record.status, MachineStatus::Stopped);
    }

    #[tokio::test]
    async fn remove_dirs_is_idempotent() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let dirs = MachineDirs::with_root(tmp.path());
        let machine = Machine::new(record("gamma"), dirs);
        machine.save().await.expect("save");
        std::fs::create_dir_all(machine.state_dir()).expect("mkdir");

        machine.remove_dirs().await.expect("first remove");
        assert!(!machine.config_dir().exists());
        assert!(!machine.state_dir().exists());
        machine.remove_dirs().await.expect("second remove");
    }

    #[test]
    fn status_strings_match_the_wire_format() {
        assert_eq!(MachineStatus::Stopped.to_string(), "stopped");
        assert_eq!(MachineStatus::Running.to_string(), "running");
        assert_eq!(
            serde_yaml::to_string(&MachineStatus::Starting).expect("yaml").trim(),
            "starting"
        );
    }

    #[test]
    fn yaml_with_unknown_fields_still_loads() {
        let yaml = "name: old\nconfig:\n  name: old\nfuture: true\n";
        let record: MachineRecord = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(record.name, "old");
        assert!(!record.ephemeral);
    }
}
