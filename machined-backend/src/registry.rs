use std::sync::Arc;

use machined_def::VmDef;
use tokio::sync::{oneshot, watch, Mutex};
use uuid::Uuid;

use crate::config::QemuPaths;
use crate::dirs::MachineDirs;
use crate::error::{Error, Result};
use crate::machine::{Machine, MachineRecord, MachineStatus};
use crate::vm::{ExitReport, Vm};

/// Process-wide set of machines, keyed by name in insertion order.
///
/// The outer mutex guards only the map itself; every machine carries its
/// own mutex that serializes start/stop/delete. Lookups clone the handle
/// and release the outer lock before awaiting anything.
pub struct MachineRegistry {
    dirs: MachineDirs,
    qemu_paths: Option<QemuPaths>,
    machines: Mutex<Vec<MachineEntry>>,
}

struct MachineEntry {
    name: String,
    handle: Arc<Mutex<Machine>>,
}

impl MachineRegistry {
    #[must_use]
    pub fn new(dirs: MachineDirs) -> Self {
        Self {
            dirs,
            qemu_paths: None,
            machines: Mutex::new(Vec::new()),
        }
    }

    /// Pin the QEMU binary and firmware instead of probing the host on
    /// every start. Used by tests.
    #[must_use]
    pub fn with_qemu_paths(mut self, paths: QemuPaths) -> Self {
        self.qemu_paths = Some(paths);
        self
    }

    /// Rehydrate persisted machines from `<config-root>/machines/*/machine.yaml`.
    /// Records come back stopped; previously spawned QEMU processes are
    /// orphaned, not adopted.
    pub async fn load_machines(&self) -> Result<()> {
        let machines_root = self.dirs.machines_config_root();
        if !tokio::fs::try_exists(&machines_root).await.unwrap_or(false) {
            return Ok(());
        }

        let mut entries = tokio::fs::read_dir(&machines_root)
            .await
            .map_err(|e| Error::io(&machines_root, e))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::io(&machines_root, e))?
        {
            let config_file = entry.path().join("machine.yaml");
            if !config_file.is_file() {
                continue;
            }
            match Machine::load(&config_file, self.dirs.clone()).await {
                Ok(machine) => {
                    let name = machine.record.name.clone();
                    let mut machines = self.machines.lock().await;
                    if machines.iter().any(|m| m.name == name) {
                        tracing::warn!(machine = %name, "duplicate persisted machine, skipping");
                        continue;
                    }
                    tracing::info!(machine = %name, "loaded persisted machine");
                    machines.push(MachineEntry {
                        name,
                        handle: Arc::new(Mutex::new(machine)),
                    });
                }
                Err(e) => {
                    tracing::warn!(file = %config_file.display(), error = %e, "failed to load machine");
                }
            }
        }
        Ok(())
    }

    /// Define a new machine. Persists to disk unless ephemeral.
    pub async fn add_machine(
        &self,
        def: VmDef,
        ephemeral: bool,
        description: String,
    ) -> Result<MachineRecord> {
        validate_name(&def.name)?;
        let record = MachineRecord::new(def, ephemeral, description);
        let machine = Machine::new(record.clone(), self.dirs.clone());
        let handle = Arc::new(Mutex::new(machine));

        {
            let mut machines = self.machines.lock().await;
            if machines.iter().any(|m| m.name == record.name) {
                return Err(Error::AlreadyExists(record.name));
            }
            machines.push(MachineEntry {
                name: record.name.clone(),
                handle: Arc::clone(&handle),
            });
        }

        if !ephemeral {
            let machine = handle.lock().await;
            if let Err(e) = machine.save().await {
                drop(machine);
                self.forget(&record.name).await;
                return Err(e);
            }
        }

        tracing::info!(machine = %record.name, ephemeral, "machine added");
        Ok(record)
    }

    pub async fn get_machine(&self, name: &str) -> Result<MachineRecord> {
        let handle = self.lookup(name).await?;
        let machine = handle.lock().await;
        Ok(machine.record.clone())
    }

    pub async fn list_machines(&self) -> Vec<MachineRecord> {
        let handles: Vec<Arc<Mutex<Machine>>> = {
            let machines = self.machines.lock().await;
            machines.iter().map(|m| Arc::clone(&m.handle)).collect()
        };
        let mut records = Vec::with_capacity(handles.len());
        for handle in handles {
            records.push(handle.lock().await.record.clone());
        }
        records
    }

    /// Replace a machine's definition. Write-through: the stored definition
    /// changes immediately, a running instance keeps its old definition
    /// until the next stop/start.
    pub async fn update_machine(&self, name: &str, def: VmDef) -> Result<MachineRecord> {
        if def.name != name {
            return Err(Error::invalid(format!(
                "definition name '{}' does not match machine '{name}'",
                def.name
            )));
        }
        let handle = self.lookup(name).await?;
        let mut machine = handle.lock().await;
        machine.record.config = def;
        if !machine.record.ephemeral {
            machine.save().await?;
        }
        tracing::info!(machine = %name, "machine updated");
        Ok(machine.record.clone())
    }

    /// Start a machine: synthesize its config, spawn QEMU, bring up QMP.
    pub async fn start_machine(&self, name: &str) -> Result<()> {
        let handle = self.lookup(name).await?;
        let mut machine = handle.lock().await;
        if machine.is_running() {
            return Err(Error::BadState {
                expected: MachineStatus::Stopped.to_string(),
                actual: machine.record.status.to_string(),
            });
        }

        machine.record.status = MachineStatus::Starting;
        let started = async {
            let paths = match &self.qemu_paths {
                Some(paths) => paths.clone(),
                None => QemuPaths::discover(machine.record.config.secure_boot)?,
            };
            let run_dir = machine.state_dir();
            let mut vm = Vm::new(&machine.record.config, &run_dir, &paths).await?;
            vm.start().await?;
            Ok::<Vm, Error>(vm)
        }
        .await;

        match started {
            Ok(mut vm) => {
                let instance_id = vm.instance_id();
                let exit_rx = vm.exit_watch();
                let qmp_closed = vm.take_qmp_closed();
                machine.instance = Some(vm);
                machine.record.status = MachineStatus::Running;
                if let Some(exit_rx) = exit_rx {
                    spawn_exit_observer(Arc::clone(&handle), instance_id, exit_rx, qmp_closed);
                }
                tracing::info!(machine = %name, "machine running");
                Ok(())
            }
            Err(e) => {
                machine.record.status = MachineStatus::Stopped;
                machine.instance = None;
                tracing::warn!(machine = %name, error = %e, "machine failed to start");
                Err(e)
            }
        }
    }

    /// Stop a machine, gracefully unless `force`.
    pub async fn stop_machine(&self, name: &str, force: bool) -> Result<()> {
        let handle = self.lookup(name).await?;
        let mut machine = handle.lock().await;
        if !machine.is_running() {
            return Err(Error::BadState {
                expected: MachineStatus::Running.to_string(),
                actual: machine.record.status.to_string(),
            });
        }

        machine.record.status = MachineStatus::Stopping;
        if let Some(mut vm) = machine.instance.take() {
            vm.stop(force).await?;
        }
        machine.record.status = MachineStatus::Stopped;
        tracing::info!(machine = %name, "machine stopped");
        Ok(())
    }

    /// Delete a machine: force-stop if running, remove its directories,
    /// drop the record. Cleanup failures leave the record in place.
    pub async fn delete_machine(&self, name: &str) -> Result<()> {
        let handle = self.lookup(name).await?;
        {
            let mut machine = handle.lock().await;
            if machine.is_running() {
                machine.record.status = MachineStatus::Stopping;
                if let Some(mut vm) = machine.instance.take() {
                    vm.stop(true).await?;
                }
            }
            machine.record.status = MachineStatus::Stopped;
            machine.remove_dirs().await?;
        }
        self.forget(name).await;
        tracing::info!(machine = %name, "machine deleted");
        Ok(())
    }

    /// Best-effort stop of every running machine, awaited to completion.
    /// Invoked on daemon shutdown; calling it twice is a no-op the second
    /// time.
    pub async fn stop_all(&self) {
        let handles: Vec<(String, Arc<Mutex<Machine>>)> = {
            let machines = self.machines.lock().await;
            machines
                .iter()
                .map(|m| (m.name.clone(), Arc::clone(&m.handle)))
                .collect()
        };
        for (name, handle) in handles {
            let mut machine = handle.lock().await;
            if !machine.is_running() {
                continue;
            }
            machine.record.status = MachineStatus::Stopping;
            if let Some(mut vm) = machine.instance.take() {
                if let Err(e) = vm.stop(false).await {
                    tracing::warn!(machine = %name, error = %e, "error stopping machine");
                }
            }
            machine.record.status = MachineStatus::Stopped;
        }
    }

    async fn lookup(&self, name: &str) -> Result<Arc<Mutex<Machine>>> {
        let machines = self.machines.lock().await;
        machines
            .iter()
            .find(|m| m.name == name)
            .map(|m| Arc::clone(&m.handle))
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    async fn forget(&self, name: &str) {
        let mut machines = self.machines.lock().await;
        machines.retain(|m| m.name != name);
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::invalid("machine name must not be empty"));
    }
    if name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(Error::invalid(format!(
            "machine name '{name}' is not filesystem-safe"
        )));
    }
    Ok(())
}

/// Watches a running instance for a spontaneous exit (child death or QMP
/// socket close) and flips the record to stopped. Guarded by the instance
/// id so a quick restart is never clobbered by a stale notification.
fn spawn_exit_observer(
    handle: Arc<Mutex<Machine>>,
    instance_id: Uuid,
    mut exit_rx: watch::Receiver<Option<ExitReport>>,
    qmp_closed: Option<oneshot::Receiver<()>>,
) {
    tokio::spawn(async move {
        let qmp_gone = async {
            match qmp_closed {
                Some(rx) => {
                    let _ = rx.await;
                }
                None => std::future::pending().await,
            }
        };
        tokio::select! {
            _ = exit_rx.changed() => {}
            () = qmp_gone => {}
        }

        let mut machine = handle.lock().await;
        let current = machine.instance.as_ref().map(Vm::instance_id);
        if current != Some(instance_id) || machine.record.status != MachineStatus::Running {
            return;
        }
        tracing::warn!(machine = %machine.record.name, "QEMU exited on its own, marking stopped");
        if let Some(mut vm) = machine.instance.take() {
            let _ = vm.stop(true).await;
        }
        machine.record.status = MachineStatus::Stopped;
    });
}
