use std::path::{Path, PathBuf};

use machined_def::{DiskAttach, DiskDef, DiskFormat, DiskKind, NicDef, PortRule};
use tokio::process::Command;

use crate::alloc::IdAlloc;
use crate::error::{Error, Result};

/// QEMU front-end driver for a block device. Exactly one variant per
/// supported attach kind; the argument builder matches exhaustively.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDriver {
    VirtioBlock,
    ScsiHd,
    Nvme,
    IdeHd,
    IdeCd,
    UsbStorage,
}

impl BlockDriver {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::VirtioBlock => "virtio-blk-pci",
            Self::ScsiHd => "scsi-hd",
            Self::Nvme => "nvme",
            Self::IdeHd => "ide-hd",
            Self::IdeCd => "ide-cd",
            Self::UsbStorage => "usb-storage",
        }
    }
}

/// A fully-resolved block device: file path already rewritten to the per-VM
/// image copy, ids and boot index assigned.
#[derive(Debug, Clone)]
pub struct BlockDevice {
    pub id: String,
    pub file: PathBuf,
    pub driver: BlockDriver,
    pub format: DiskFormat,
    pub media_cdrom: bool,
    pub read_only: bool,
    pub block_size: u32,
    pub bus_addr: String,
    pub boot_index: u32,
}

/// A fully-resolved user-mode NIC.
#[derive(Debug, Clone)]
pub struct NetDevice {
    pub id: String,
    pub driver: String,
    pub mac: Option<String>,
    pub bus_addr: String,
    pub boot_index: u32,
    pub ports: Vec<PortRule>,
}

#[derive(Debug, Clone)]
pub struct ScsiController {
    pub id: String,
    pub iothread: String,
}

#[derive(Debug, Clone)]
pub struct IoThread {
    pub id: String,
}

/// Virtio RNG fed from a host entropy device.
#[derive(Debug, Clone)]
pub struct RngDevice {
    pub id: String,
    pub filename: PathBuf,
    pub bus: String,
    pub addr: String,
}

/// A UNIX-socket chardev and the socket path QEMU will create for it.
#[derive(Debug, Clone)]
pub struct CharSocket {
    pub id: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PcieRootPort {
    pub id: String,
    pub chassis: u32,
    pub slot: u32,
}

/// UEFI firmware pair: read-only code image plus the per-VM writable
/// variables copy.
#[derive(Debug, Clone)]
pub struct UefiFirmware {
    pub code: PathBuf,
    pub vars: PathBuf,
}

#[derive(Debug, Clone)]
pub struct SpiceDisplay {
    pub port: u16,
}

const SUPPORTED_NIC_DRIVERS: &[&str] =
    &["virtio-net-pci", "virtio-net", "e1000", "e1000e", "rtl8139"];

const DEFAULT_NIC_DRIVER: &str = "virtio-net-pci";

/// Resolve a disk definition's file path against the run directory.
/// Called before import, so relative paths land inside the per-VM tree.
pub fn sanitize_disk(disk: &mut DiskDef, run_dir: &Path) -> Result<()> {
    if disk.file.as_os_str().is_empty() {
        return Err(Error::invalid("disk has no file path"));
    }
    if disk.file.is_relative() {
        disk.file = run_dir.join(&disk.file);
    }
    Ok(())
}

/// Map a sanitized disk onto its QEMU block device, allocating the drive id
/// and, when the definition left it open, the boot index.
pub fn block_device(disk: &DiskDef, alloc: &mut IdAlloc) -> Result<BlockDevice> {
    let (driver, media_cdrom) = match (disk.attach, disk.kind) {
        (DiskAttach::Virtio, _) => (BlockDriver::VirtioBlock, false),
        (DiskAttach::Scsi, _) => (BlockDriver::ScsiHd, false),
        (DiskAttach::Nvme, _) => (BlockDriver::Nvme, false),
        (DiskAttach::Ide, DiskKind::Cdrom) => (BlockDriver::IdeCd, true),
        (DiskAttach::Ide, DiskKind::Hdd) => (BlockDriver::IdeHd, false),
        (DiskAttach::Usb, _) => (BlockDriver::UsbStorage, false),
    };

    if !disk.bus_addr.is_empty() {
        // Fail early rather than at emission time
        parse_bus_addr(&disk.bus_addr)?;
    }

    let boot_index = disk
        .boot_index
        .unwrap_or_else(|| alloc.next_boot_index());

    Ok(BlockDevice {
        id: format!("drive{}", alloc.next("drive")),
        file: disk.file.clone(),
        driver,
        format: disk.format,
        media_cdrom,
        read_only: disk.read_only,
        block_size: disk.block_size,
        bus_addr: disk.bus_addr.clone(),
        boot_index,
    })
}

/// Map a NIC definition onto its user-mode net device.
pub fn net_device(nic: &NicDef, alloc: &mut IdAlloc) -> Result<NetDevice> {
    let driver = if nic.device.is_empty() {
        DEFAULT_NIC_DRIVER.to_string()
    } else if SUPPORTED_NIC_DRIVERS.contains(&nic.device.as_str()) {
        nic.device.clone()
    } else {
        return Err(Error::invalid(format!(
            "unknown NIC device '{}', supported: {}",
            nic.device,
            SUPPORTED_NIC_DRIVERS.join(", ")
        )));
    };

    if !nic.bus_addr.is_empty() {
        parse_bus_addr(&nic.bus_addr)?;
    }

    let id = if nic.id.is_empty() {
        format!("net{}", alloc.next("net"))
    } else {
        nic.id.clone()
    };

    let boot_index = nic.boot_index.unwrap_or_else(|| alloc.next_boot_index());

    Ok(NetDevice {
        id,
        driver,
        mac: nic.mac.clone(),
        bus_addr: nic.bus_addr.clone(),
        boot_index,
        ports: nic.ports.clone(),
    })
}

/// Parse a PCIe slot number written as decimal or `0x`-prefixed hex.
pub fn parse_bus_addr(addr: &str) -> Result<u8> {
    let parsed = if let Some(hex) = addr.strip_prefix("0x") {
        u8::from_str_radix(hex, 16)
    } else {
        addr.parse::<u8>()
    };
    parsed.map_err(|_| Error::invalid(format!("invalid PCIe bus address '{addr}'")))
}

/// Import a disk into the per-VM image directory, rewriting `disk.file` to
/// the destination. A sized disk is created empty (sparse); an unsized disk
/// must already exist and is reflink-copied.
pub async fn import_disk(disk: &mut DiskDef, image_dir: &Path) -> Result<()> {
    let src = disk.file.clone();
    let file_name = src
        .file_name()
        .ok_or_else(|| Error::invalid(format!("disk path {} has no file name", src.display())))?;
    let dest = image_dir.join(file_name);

    if disk.size_bytes > 0 {
        let file = tokio::fs::File::create(&dest)
            .await
            .map_err(|e| Error::io(&dest, e))?;
        file.set_len(disk.size_bytes)
            .await
            .map_err(|e| Error::io(&dest, e))?;
    } else {
        if !tokio::fs::try_exists(&src).await.unwrap_or(false) {
            return Err(Error::invalid(format!(
                "disk source {} does not exist and no size was given",
                src.display()
            )));
        }
        tracing::info!("importing disk image {} -> {}", src.display(), dest.display());
        copy_file_ref_sparse(&src, &dest).await?;
    }

    disk.file = dest;
    Ok(())
}

/// Clone a file with `cp --reflink=auto --sparse=auto`: a copy-on-write
/// clone where the filesystem supports it, a sparse copy everywhere else.
async fn copy_file_ref_sparse(src: &Path, dest: &Path) -> Result<()> {
    let cp = which::which("cp")
        .map_err(|e| Error::io("cp", std::io::Error::other(e.to_string())))?;
    let output = Command::new(cp)
        .arg("--force")
        .arg("--reflink=auto")
        .arg("--sparse=auto")
        .arg(src)
        .arg(dest)
        .output()
        .await
        .map_err(|e| Error::io(src, e))?;

    if !output.status.success() {
        return Err(Error::io(
            dest,
            std::io::Error::other(String::from_utf8_lossy(&output.stderr).into_owned()),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk(attach: DiskAttach, kind: DiskKind) -> DiskDef {
        DiskDef {
            file: PathBuf::from("/images/root.qcow2"),
            attach,
            kind,
            ..DiskDef::default()
        }
    }

    #[test]
    fn attach_kinds_map_to_drivers() {
        let mut alloc = IdAlloc::new();
        let cases = [
            (DiskAttach::Virtio, DiskKind::Hdd, BlockDriver::VirtioBlock),
            (DiskAttach::Scsi, DiskKind::Hdd, BlockDriver::ScsiHd),
            (DiskAttach::Nvme, DiskKind::Hdd, BlockDriver::Nvme),
            (DiskAttach::Ide, DiskKind::Hdd, BlockDriver::IdeHd),
            (DiskAttach::Ide, DiskKind::Cdrom, BlockDriver::IdeCd),
            (DiskAttach::Usb, DiskKind::Hdd, BlockDriver::UsbStorage),
        ];
        for (attach, kind, want) in cases {
            let blk = block_device(&disk(attach, kind), &mut alloc).expect("map");
            assert_eq!(blk.driver, want);
        }
    }

    #[test]
    fn ide_cdrom_gets_cdrom_media() {
        let mut alloc = IdAlloc::new();
        let blk = block_device(&disk(DiskAttach::Ide, DiskKind::Cdrom), &mut alloc).expect("map");
        assert!(blk.media_cdrom);
        let blk = block_device(&disk(DiskAttach::Ide, DiskKind::Hdd), &mut alloc).expect("map");
        assert!(!blk.media_cdrom);
    }

    #[test]
    fn drive_ids_increase_per_allocator() {
        let mut alloc = IdAlloc::new();
        let a = block_device(&disk(DiskAttach::Virtio, DiskKind::Hdd), &mut alloc).expect("map");
        let b = block_device(&disk(DiskAttach::Virtio, DiskKind::Hdd), &mut alloc).expect("map");
        assert_eq!(a.id, "drive0");
        assert_eq!(b.id, "drive1");
        assert_ne!(a.boot_index, b.boot_index);
    }

    #[test]
    fn explicit_boot_index_is_honored() {
        let mut alloc = IdAlloc::new();
        let mut d = disk(DiskAttach::Virtio, DiskKind::Hdd);
        d.boot_index = Some(7);
        let blk = block_device(&d, &mut alloc).expect("map");
        assert_eq!(blk.boot_index, 7);
    }

    #[test]
    fn relative_disk_paths_resolve_against_run_dir() {
        let mut d = disk(DiskAttach::Virtio, DiskKind::Hdd);
        d.file = PathBuf::from("root.qcow2");
        sanitize_disk(&mut d, Path::new("/run/machines/alpha")).expect("sanitize");
        assert_eq!(d.file, PathBuf::from("/run/machines/alpha/root.qcow2"));
    }

    #[test]
    fn empty_disk_path_is_invalid() {
        let mut d = DiskDef::default();
        assert!(matches!(
            sanitize_disk(&mut d, Path::new("/run")),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn nic_defaults_and_id_allocation() {
        let mut alloc = IdAlloc::new();
        let nic = net_device(&NicDef::default(), &mut alloc).expect("map");
        assert_eq!(nic.driver, "virtio-net-pci");
        assert_eq!(nic.id, "net0");
        let nic = net_device(&NicDef::default(), &mut alloc).expect("map");
        assert_eq!(nic.id, "net1");
    }

    #[test]
    fn unknown_nic_driver_is_rejected() {
        let mut alloc = IdAlloc::new();
        let nic = NicDef {
            device: "ne2000".to_string(),
            ..NicDef::default()
        };
        assert!(matches!(
            net_device(&nic, &mut alloc),
            Err(Error::InvalidConfig(_))
        ));
    }

    #[test]
    fn bus_addr_accepts_decimal_and_hex() {
        assert_eq!(parse_bus_addr("3").expect("decimal"), 3);
        assert_eq!(parse_bus_addr("0x1f").expect("hex"), 0x1f);
        assert!(parse_bus_addr("pcie.0").is_err());
    }

    #[tokio::test]
    async fn sized_disk_is_created_sparse() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut d = DiskDef {
            file: tmp.path().join("src").join("blank.raw"),
            size_bytes: 4096,
            ..DiskDef::default()
        };
        import_disk(&mut d, tmp.path()).await.expect("import");
        assert_eq!(d.file, tmp.path().join("blank.raw"));
        let meta = std::fs::metadata(&d.file).expect("metadata");
        assert_eq!(meta.len(), 4096);
    }

    #[tokio::test]
    async fn unsized_disk_requires_existing_source() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let mut d = DiskDef {
            file: tmp.path().join("missing.qcow2"),
            ..DiskDef::default()
        };
        assert!(matches!(
            import_disk(&mut d, tmp.path()).await,
            Err(Error::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn unsized_disk_is_copied_into_image_dir() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let src_dir = tmp.path().join("src");
        std::fs::create_dir_all(&src_dir).expect("mkdir");
        let src = src_dir.join("seed.qcow2");
        std::fs::write(&src, b"not really qcow2").expect("write");

        let image_dir = tmp.path().join("images");
        std::fs::create_dir_all(&image_dir).expect("mkdir");
        let mut d = DiskDef {
            file: src.clone(),
            ..DiskDef::default()
        };
        import_disk(&mut d, &image_dir).await.expect("import");
        assert_eq!(d.file, image_dir.join("seed.qcow2"));
        assert_eq!(
            std::fs::read(&d.file).expect("read copy"),
            b"not really qcow2"
        );
        // source stays in place
        assert!(src.exists());
    }
}
