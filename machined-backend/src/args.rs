use std::collections::HashSet;
use std::fmt::Write as _;

use crate::config::Config;
use crate::device::{parse_bus_addr, BlockDevice, BlockDriver, NetDevice};
use crate::error::{Error, Result};

/// Render a fully-resolved `Config` into the QEMU argument vector.
///
/// Pure and deterministic: the same config always yields the same argv.
/// Emission order is fixed so diffs between two invocations of the same
/// machine stay readable: machine, smp, memory, cpu, boot, chardevs, QMP,
/// serial, monitor, PCIe root ports, UEFI pflash, RNG, block devices, SCSI
/// controllers, IOThreads, net devices, SPICE, knobs, globals.
pub fn build_qemu_args(config: &Config) -> Result<Vec<String>> {
    let mut args = Vec::new();
    let mut ids = IdSet::default();

    args.push("-name".to_string());
    args.push(config.name.clone());

    args.push("-machine".to_string());
    args.push(format!(
        "{},accel={},smm={}",
        config.machine_type,
        config.accel,
        on_off(config.smm)
    ));

    args.push("-smp".to_string());
    args.push(config.smp_cpus.to_string());

    args.push("-m".to_string());
    args.push(format!("{}m", config.memory_mib));

    args.push("-cpu".to_string());
    let mut cpu = config.cpu_model.clone();
    for flag in &config.cpu_flags {
        write!(cpu, ",{flag}").expect("write to string");
    }
    args.push(cpu);

    if !config.boot_order.is_empty() {
        args.push("-boot".to_string());
        args.push(config.boot_order.clone());
    }

    // chardevs first, then the front-ends that reference them
    for socket in [&config.serial, &config.monitor, &config.qmp] {
        ids.claim(&socket.id)?;
        args.push("-chardev".to_string());
        args.push(format!(
            "socket,id={},path={},server=on,wait=off",
            socket.id,
            socket.path.display()
        ));
    }

    args.push("-mon".to_string());
    args.push(format!("chardev={},mode=control", config.qmp.id));

    args.push("-serial".to_string());
    args.push(format!("chardev:{}", config.serial.id));

    args.push("-mon".to_string());
    args.push(format!("chardev={},mode=readline", config.monitor.id));

    for port in &config.root_ports {
        ids.claim(&port.id)?;
        args.push("-device".to_string());
        args.push(format!(
            "pcie-root-port,id={},chassis={},slot={},bus=pcie.0",
            port.id, port.chassis, port.slot
        ));
    }

    if let Some(firmware) = &config.firmware {
        ids.claim("pflash0")?;
        args.push("-drive".to_string());
        args.push(format!(
            "file={},id=pflash0,if=pflash,format=raw,readonly=on",
            firmware.code.display()
        ));
        ids.claim("pflash1")?;
        args.push("-drive".to_string());
        args.push(format!(
            "file={},id=pflash1,if=pflash,format=raw",
            firmware.vars.display()
        ));
    }

    if let Some(rng) = &config.rng {
        ids.claim(&rng.id)?;
        args.push("-object".to_string());
        args.push(format!(
            "rng-random,id={},filename={}",
            rng.id,
            rng.filename.display()
        ));
        args.push("-device".to_string());
        args.push(format!(
            "virtio-rng-pci,rng={},bus={},addr={}",
            rng.id, rng.bus, rng.addr
        ));
    }

    let scsi_bus = config.scsi_controllers.first().map(|c| c.id.as_str());
    for disk in &config.disks {
        ids.claim(&disk.id)?;
        args.push("-drive".to_string());
        args.push(drive_arg(disk));
        args.push("-device".to_string());
        args.push(block_device_arg(disk, scsi_bus)?);
    }

    for controller in &config.scsi_controllers {
        ids.claim(&controller.id)?;
        args.push("-device".to_string());
        args.push(format!(
            "virtio-scsi-pci,id={},iothread={}",
            controller.id, controller.iothread
        ));
    }

    for iothread in &config.iothreads {
        ids.claim(&iothread.id)?;
        args.push("-object".to_string());
        args.push(format!("iothread,id={}", iothread.id));
    }

    for nic in &config.nics {
        ids.claim(&nic.id)?;
        args.push("-netdev".to_string());
        args.push(netdev_arg(nic));
        args.push("-device".to_string());
        args.push(net_device_arg(nic)?);
    }

    if let Some(spice) = &config.spice {
        args.push("-spice".to_string());
        args.push(format!("port={},disable-ticketing=on", spice.port));
    }

    if config.no_hpet {
        args.push("-no-hpet".to_string());
    }
    if config.nographic {
        args.push("-nographic".to_string());
    }

    for global in &config.globals {
        args.push("-global".to_string());
        args.push(global.clone());
    }

    Ok(args)
}

/// Tracks every emitted `id=` so a malformed config cannot produce an argv
/// QEMU would reject with a duplicate-id error.
#[derive(Default)]
struct IdSet(HashSet<String>);

impl IdSet {
    fn claim(&mut self, id: &str) -> Result<()> {
        if self.0.insert(id.to_string()) {
            Ok(())
        } else {
            Err(Error::invalid(format!("duplicate device id '{id}'")))
        }
    }
}

const fn on_off(v: bool) -> &'static str {
    if v { "on" } else { "off" }
}

fn drive_arg(disk: &BlockDevice) -> String {
    let mut arg = format!(
        "file={},id={},if=none,format={},aio=threads",
        disk.file.display(),
        disk.id,
        disk.format.as_str()
    );
    if disk.media_cdrom {
        arg.push_str(",media=cdrom");
    }
    if disk.read_only {
        arg.push_str(",readonly=on");
    }
    arg
}

fn block_device_arg(disk: &BlockDevice, scsi_bus: Option<&str>) -> Result<String> {
    let mut arg = format!("{},drive={}", disk.driver.as_str(), disk.id);

    match disk.driver {
        BlockDriver::ScsiHd => {
            let bus = scsi_bus.ok_or_else(|| {
                Error::invalid(format!("disk {} needs a SCSI controller", disk.id))
            })?;
            write!(arg, ",bus={bus}.0").expect("write to string");
        }
        BlockDriver::Nvme => {
            // nvme requires a serial; reuse the drive id
            write!(arg, ",serial={}", disk.id).expect("write to string");
        }
        BlockDriver::VirtioBlock | BlockDriver::IdeHd | BlockDriver::IdeCd
        | BlockDriver::UsbStorage => {}
    }

    write!(arg, ",bootindex={}", disk.boot_index).expect("write to string");

    if !disk.bus_addr.is_empty() && is_pci_block_driver(disk.driver) {
        write!(arg, ",addr=0x{:02x},bus=pcie.0", parse_bus_addr(&disk.bus_addr)?)
            .expect("write to string");
    }

    if disk.block_size > 0 {
        write!(
            arg,
            ",logical_block_size={},physical_block_size={}",
            disk.block_size, disk.block_size
        )
        .expect("write to string");
    }

    Ok(arg)
}

const fn is_pci_block_driver(driver: BlockDriver) -> bool {
    matches!(driver, BlockDriver::VirtioBlock | BlockDriver::Nvme)
}

fn netdev_arg(nic: &NetDevice) -> String {
    let mut arg = format!("user,id={},ipv4=on", nic.id);
    for rule in &nic.ports {
        // hostfwd=tcp:haddr:hport-gaddr:gport
        write!(arg, ",hostfwd={rule}").expect("write to string");
    }
    arg
}

fn net_device_arg(nic: &NetDevice) -> Result<String> {
    let mut arg = format!("{},netdev={}", nic.driver, nic.id);
    if let Some(mac) = &nic.mac {
        write!(arg, ",mac={mac}").expect("write to string");
    }
    write!(arg, ",bootindex={}", nic.boot_index).expect("write to string");
    if !nic.bus_addr.is_empty() {
        write!(arg, ",addr=0x{:02x},bus=pcie.0", parse_bus_addr(&nic.bus_addr)?)
            .expect("write to string");
    }
    Ok(arg)
}
