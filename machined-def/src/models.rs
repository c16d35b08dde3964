use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ports::PortRule;

/// A declarative machine definition, as submitted by a client and persisted
/// to `machine.yaml`. Unknown fields are ignored so older daemons can read
/// newer definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VmDef {
    pub name: String,

    /// Number of vCPUs; 0 means the default (4).
    #[serde(default)]
    pub cpus: u32,

    /// Guest memory in MiB; 0 means the default (4096).
    #[serde(default, alias = "memory")]
    pub memory_mib: u32,

    /// Passed through verbatim to `-boot` when non-empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub boot: String,

    /// Host path of an ISO image, expanded into an IDE CD-ROM disk.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cdrom: Option<PathBuf>,

    /// Host path of a UEFI variables template; defaults to the OVMF_VARS
    /// image next to the discovered firmware code.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uefi_vars: Option<PathBuf>,

    #[serde(default)]
    pub secure_boot: bool,

    #[serde(default)]
    pub tpm: bool,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tpm_version: String,

    /// When set, a SPICE display is configured; otherwise `-nographic`.
    #[serde(default)]
    pub gui: bool,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disks: Vec<DiskDef>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nics: Vec<NicDef>,
}

impl VmDef {
    /// Effective vCPU count after defaulting.
    #[must_use]
    pub const fn effective_cpus(&self) -> u32 {
        if self.cpus < 1 { 4 } else { self.cpus }
    }

    /// Effective memory size in MiB after defaulting.
    #[must_use]
    pub const fn effective_memory_mib(&self) -> u32 {
        if self.memory_mib < 1 {
            4096
        } else {
            self.memory_mib
        }
    }
}

/// On-disk image format of a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    Raw,
    #[default]
    Qcow2,
}

impl DiskFormat {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Qcow2 => "qcow2",
        }
    }
}

/// How a disk is attached to the guest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskAttach {
    #[default]
    Virtio,
    Scsi,
    Nvme,
    Ide,
    Usb,
}

/// Media kind of a disk.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiskKind {
    #[default]
    Hdd,
    Cdrom,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiskDef {
    pub file: PathBuf,

    /// When non-zero the file is created empty at this size; when zero the
    /// file must already exist and is imported into the per-VM directory.
    #[serde(default, alias = "size")]
    pub size_bytes: u64,

    #[serde(default)]
    pub format: DiskFormat,

    #[serde(default)]
    pub attach: DiskAttach,

    #[serde(rename = "type", default)]
    pub kind: DiskKind,

    /// Logical/physical block size in bytes; 0 leaves QEMU's default.
    #[serde(default)]
    pub block_size: u32,

    /// PCIe slot number for the device, e.g. "3"; empty lets QEMU choose.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus_addr: String,

    #[serde(default)]
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_index: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NicDef {
    /// Netdev id; allocated as `net<n>` when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,

    /// QEMU NIC driver, e.g. `virtio-net-pci` or `e1000`; empty selects
    /// virtio-net-pci.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub device: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bus_addr: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_index: Option<u32>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ports: Vec<PortRule>,
}
