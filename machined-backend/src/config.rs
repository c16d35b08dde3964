use std::path::{Path, PathBuf};

use machined_def::{DiskAttach, DiskDef, DiskFormat, DiskKind, VmDef};

use crate::alloc::IdAlloc;
use crate::device::{
    self, BlockDevice, CharSocket, IoThread, NetDevice, PcieRootPort, RngDevice, ScsiController,
    SpiceDisplay, UefiFirmware,
};
use crate::dirs;
use crate::error::{Error, Result};

// QEMU/KVM binary discovery, most preferred first
const EMULATORS: &[&str] = &["qemu-kvm", "qemu-system-x86_64", "kvm"];
const EMULATOR_PREFIXES: &[&str] = &["/usr/libexec", "/usr/bin"];

// Common OVMF code image locations across distributions
const UEFI_CODE_PATHS: &[&str] = &[
    "/usr/share/OVMF/OVMF_CODE.fd",
    "/usr/share/edk2/ovmf/OVMF_CODE.fd",
    "/usr/share/edk2-ovmf/x64/OVMF_CODE.fd",
    "/usr/share/qemu/OVMF_CODE.fd",
];

const SPICE_BASE_PORT: u16 = 5900;
const SPICE_PORT_SCAN: u16 = 100;

/// Host-side binaries and firmware images a machine needs, resolved once
/// per start. Tests construct this directly instead of probing the host.
#[derive(Debug, Clone)]
pub struct QemuPaths {
    pub binary: PathBuf,
    pub firmware_code: Option<PathBuf>,
    pub nvram_template: Option<PathBuf>,
}

impl QemuPaths {
    /// Probe the host for a QEMU/KVM binary and UEFI firmware images.
    pub fn discover(secure_boot: bool) -> Result<Self> {
        let binary = find_kvm_binary()?;
        let firmware_code = find_uefi_code(secure_boot);
        let nvram_template = firmware_code.as_deref().and_then(vars_template_for);
        Ok(Self {
            binary,
            firmware_code,
            nvram_template,
        })
    }
}

fn find_kvm_binary() -> Result<PathBuf> {
    for emulator in EMULATORS {
        for prefix in EMULATOR_PREFIXES {
            let candidate = Path::new(prefix).join(emulator);
            if candidate.exists() {
                return Ok(candidate);
            }
        }
    }
    Err(Error::invalid(format!(
        "no QEMU/KVM binary ({}) found under {}",
        EMULATORS.join(", "),
        EMULATOR_PREFIXES.join(", ")
    )))
}

fn find_uefi_code(secure_boot: bool) -> Option<PathBuf> {
    for candidate in UEFI_CODE_PATHS {
        let path = Path::new(candidate);
        if secure_boot {
            let secboot = path.with_file_name("OVMF_CODE.secboot.fd");
            if secboot.exists() {
                return Some(secboot);
            }
        }
        if path.exists() {
            return Some(path.to_path_buf());
        }
    }
    None
}

/// The writable-variables template shipped next to a code image.
fn vars_template_for(code: &Path) -> Option<PathBuf> {
    let vars = code.with_file_name("OVMF_VARS.fd");
    vars.exists().then_some(vars)
}

/// A machine definition resolved into everything the argument builder
/// needs: devices with assigned ids, socket paths, firmware copies.
#[derive(Debug, Clone)]
pub struct Config {
    pub name: String,
    pub binary: PathBuf,
    pub machine_type: String,
    pub accel: String,
    pub smm: bool,
    pub smp_cpus: u32,
    pub memory_mib: u32,
    pub cpu_model: String,
    pub cpu_flags: Vec<String>,
    pub boot_order: String,
    pub serial: CharSocket,
    pub monitor: CharSocket,
    pub qmp: CharSocket,
    pub root_ports: Vec<PcieRootPort>,
    pub firmware: Option<UefiFirmware>,
    pub rng: Option<RngDevice>,
    pub disks: Vec<BlockDevice>,
    pub scsi_controllers: Vec<ScsiController>,
    pub iothreads: Vec<IoThread>,
    pub nics: Vec<NetDevice>,
    pub spice: Option<SpiceDisplay>,
    pub no_hpet: bool,
    pub nographic: bool,
    pub globals: Vec<String>,
}

impl Config {
    /// Control sockets QEMU is expected to create, in the order the
    /// supervisor waits on them.
    #[must_use]
    pub fn socket_paths(&self) -> Vec<PathBuf> {
        vec![
            self.serial.path.clone(),
            self.monitor.path.clone(),
            self.qmp.path.clone(),
        ]
    }
}

/// Build the full `Config` for one machine. Has observable side effects
/// (run-dir creation, NVRAM copy, disk import) and therefore runs before
/// every start, after any update.
pub async fn synthesize_config(def: &VmDef, run_dir: &Path, paths: &QemuPaths) -> Result<Config> {
    if !tokio::fs::try_exists(run_dir).await.unwrap_or(false) {
        tokio::fs::create_dir_all(run_dir)
            .await
            .map_err(|e| Error::io(run_dir, e))?;
    }

    let firmware = prepare_firmware(def, run_dir, paths).await?;

    // cdrom shortcut expands to a trailing IDE CD-ROM disk
    let mut disks: Vec<DiskDef> = def.disks.clone();
    if let Some(cdrom) = &def.cdrom {
        disks.push(DiskDef {
            file: cdrom.clone(),
            format: DiskFormat::Raw,
            attach: DiskAttach::Ide,
            kind: DiskKind::Cdrom,
            read_only: true,
            ..DiskDef::default()
        });
    }

    let mut alloc = IdAlloc::new();
    for index in disks.iter().filter_map(|d| d.boot_index) {
        alloc.reserve_boot_index(index);
    }
    for index in def.nics.iter().filter_map(|n| n.boot_index) {
        alloc.reserve_boot_index(index);
    }

    let mut block_devices = Vec::with_capacity(disks.len());
    let mut scsi_controllers = Vec::new();
    let mut iothreads = Vec::new();
    for disk in &mut disks {
        device::sanitize_disk(disk, run_dir)?;
        device::import_disk(disk, run_dir).await?;
        block_devices.push(device::block_device(disk, &mut alloc)?);

        if disk.attach == DiskAttach::Scsi && scsi_controllers.is_empty() {
            let iothread = IoThread {
                id: format!("iothread{}", alloc.next("iothread")),
            };
            scsi_controllers.push(ScsiController {
                id: format!("scsi{}", alloc.next("scsi")),
                iothread: iothread.id.clone(),
            });
            iothreads.push(iothread);
        }
    }

    let mut nics = Vec::with_capacity(def.nics.len());
    for nic in &def.nics {
        nics.push(device::net_device(nic, &mut alloc)?);
    }

    let spice = if def.gui {
        Some(SpiceDisplay {
            port: find_free_tcp_port(SPICE_BASE_PORT)?,
        })
    } else {
        None
    };

    Ok(Config {
        name: def.name.clone(),
        binary: paths.binary.clone(),
        machine_type: "q35".to_string(),
        accel: "kvm".to_string(),
        smm: true,
        smp_cpus: def.effective_cpus(),
        memory_mib: def.effective_memory_mib(),
        cpu_model: "qemu64".to_string(),
        cpu_flags: vec!["+x2apic".to_string()],
        boot_order: def.boot.clone(),
        serial: CharSocket {
            id: "serial0".to_string(),
            path: run_dir.join(dirs::CONSOLE_SOCKET),
        },
        monitor: CharSocket {
            id: "monitor0".to_string(),
            path: run_dir.join(dirs::MONITOR_SOCKET),
        },
        qmp: CharSocket {
            id: "qmp0".to_string(),
            path: run_dir.join(dirs::QMP_SOCKET),
        },
        root_ports: vec![
            PcieRootPort {
                id: "root-port.0".to_string(),
                chassis: 1,
                slot: 0,
            },
            PcieRootPort {
                id: "root-port.1".to_string(),
                chassis: 2,
                slot: 1,
            },
        ],
        firmware,
        rng: Some(RngDevice {
            id: "rng0".to_string(),
            filename: PathBuf::from("/dev/urandom"),
            bus: "pcie.0".to_string(),
            addr: "0x03".to_string(),
        }),
        disks: block_devices,
        scsi_controllers,
        iothreads,
        nics,
        spice,
        no_hpet: true,
        nographic: !def.gui,
        globals: vec![
            "ICH9-LPC.disable_s3=1".to_string(),
            "driver=cfi.pflash01,property=secure,value=on".to_string(),
        ],
    })
}

/// Copy the NVRAM template into the run directory so every machine writes
/// its own variables. Missing firmware downgrades to a warning; UEFI is
/// only mandatory when the definition names a template itself.
async fn prepare_firmware(
    def: &VmDef,
    run_dir: &Path,
    paths: &QemuPaths,
) -> Result<Option<UefiFirmware>> {
    let Some(code) = &paths.firmware_code else {
        if def.uefi_vars.is_some() {
            return Err(Error::invalid(
                "uefi_vars was set but no UEFI firmware code image was found on the host",
            ));
        }
        tracing::warn!("no UEFI firmware found, machine will boot with the default BIOS");
        return Ok(None);
    };

    let template = match (&def.uefi_vars, &paths.nvram_template) {
        (Some(custom), _) => custom.clone(),
        (None, Some(template)) => template.clone(),
        (None, None) => {
            tracing::warn!(
                "UEFI code {} has no variables template, skipping firmware",
                code.display()
            );
            return Ok(None);
        }
    };

    let vars = run_dir.join(dirs::UEFI_VARS_FILENAME);
    tokio::fs::copy(&template, &vars)
        .await
        .map_err(|e| Error::io(&template, e))?;

    Ok(Some(UefiFirmware {
        code: code.clone(),
        vars,
    }))
}

/// First free TCP port at or above `base` on the loopback interface.
fn find_free_tcp_port(base: u16) -> Result<u16> {
    for port in base..base.saturating_add(SPICE_PORT_SCAN) {
        if std::net::TcpListener::bind(("127.0.0.1", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(Error::invalid(format!(
        "no free display port in {base}..{}",
        base.saturating_add(SPICE_PORT_SCAN)
    )))
}
