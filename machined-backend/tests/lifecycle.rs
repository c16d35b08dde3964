//! Full lifecycle scenarios against a scripted QMP peer. The "QEMU" child
//! is a shell script that records its pid and sleeps; the control sockets
//! it would normally create are served by the test.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use machined_backend::config::QemuPaths;
use machined_backend::{MachineDirs, MachineRegistry, MachineStatus};
use machined_def::VmDef;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixListener;

const GREETING: &str = concat!(
    r#"{"QMP": {"version": {"qemu": {"major": 8, "minor": 2, "micro": 0},"#,
    r#" "package": "qemu-8.2.0"}, "capabilities": []}}"#,
    "\n"
);

fn fake_qemu(dir: &Path) -> (QemuPaths, PathBuf) {
    let pid_file = dir.join("qemu.pid");
    let path = dir.join("fake-qemu");
    std::fs::write(
        &path,
        format!("#!/bin/sh\necho $$ > {}\nexec sleep 30\n", pid_file.display()),
    )
    .expect("write script");
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = std::fs::metadata(&path).expect("metadata").permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).expect("chmod");
    }
    (
        QemuPaths {
            binary: path,
            firmware_code: None,
            nvram_template: None,
        },
        pid_file,
    )
}

/// Serve the three control sockets for one machine. The QMP socket speaks
/// enough of the protocol for capability negotiation and, on
/// `system_powerdown`, kills the recorded child pid so the guest appears
/// to shut down.
fn serve_control_sockets(state_dir: &Path, pid_file: PathBuf) {
    std::fs::create_dir_all(state_dir).expect("state dir");
    // serial and monitor only need to exist
    let _serial = UnixListener::bind(state_dir.join("console.sock")).expect("console.sock");
    let _monitor = UnixListener::bind(state_dir.join("monitor.sock")).expect("monitor.sock");
    let qmp = UnixListener::bind(state_dir.join("qmp.sock")).expect("qmp.sock");
    std::mem::forget(_serial);
    std::mem::forget(_monitor);

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = qmp.accept().await else {
                return;
            };
            let pid_file = pid_file.clone();
            tokio::spawn(async move {
                let (read_half, mut write_half) = stream.into_split();
                let mut lines = BufReader::new(read_half).lines();
                if write_half.write_all(GREETING.as_bytes()).await.is_err() {
                    return;
                }
                while let Ok(Some(line)) = lines.next_line().await {
                    let Ok(cmd) = serde_json::from_str::<Value>(&line) else {
                        continue;
                    };
                    let mut reply = serde_json::json!({"return": {}});
                    if let Some(id) = cmd.get("id") {
                        reply["id"] = id.clone();
                    }
                    let mut encoded = serde_json::to_vec(&reply).expect("encode");
                    encoded.push(b'\n');
                    if write_half.write_all(&encoded).await.is_err() {
                        return;
                    }
                    if cmd.get("execute").and_then(Value::as_str) == Some("system_powerdown") {
                        if let Ok(pid) = tokio::fs::read_to_string(&pid_file).await {
                            let _ = tokio::process::Command::new("kill")
                                .arg(pid.trim())
                                .status()
                                .await;
                        }
                    }
                }
            });
        }
    });
}

fn alpha() -> VmDef {
    VmDef {
        name: "alpha".to_string(),
        cpus: 2,
        memory_mib: 1024,
        ..VmDef::default()
    }
}

#[tokio::test]
async fn create_start_stop_round_trip() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dirs = MachineDirs::with_root(tmp.path());
    let (paths, pid_file) = fake_qemu(tmp.path());
    let registry = MachineRegistry::new(dirs.clone()).with_qemu_paths(paths);

    registry
        .add_machine(alpha(), false, String::new())
        .await
        .expect("add");
    serve_control_sockets(&dirs.machine_state_dir("alpha"), pid_file);

    registry.start_machine("alpha").await.expect("start");
    let record = registry.get_machine("alpha").await.expect("get");
    assert_eq!(record.status, MachineStatus::Running);
    assert!(dirs.machine_qmp_socket("alpha").exists());

    // graceful stop: powerdown over QMP, child exits, reaped well inside
    // the grace window
    let begun = Instant::now();
    registry
        .stop_machine("alpha", false)
        .await
        .expect("graceful stop");
    assert!(begun.elapsed() < Duration::from_secs(11));

    let record = registry.get_machine("alpha").await.expect("get");
    assert_eq!(record.status, MachineStatus::Stopped);
}

#[tokio::test]
async fn force_stop_skips_qmp_entirely() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dirs = MachineDirs::with_root(tmp.path());
    let (paths, pid_file) = fake_qemu(tmp.path());
    let registry = MachineRegistry::new(dirs.clone()).with_qemu_paths(paths);

    registry
        .add_machine(alpha(), false, String::new())
        .await
        .expect("add");
    serve_control_sockets(&dirs.machine_state_dir("alpha"), pid_file);

    registry.start_machine("alpha").await.expect("start");
    // break the QMP socket out from under the machine
    std::fs::remove_file(dirs.machine_qmp_socket("alpha")).expect("unlink qmp");

    let begun = Instant::now();
    registry
        .stop_machine("alpha", true)
        .await
        .expect("force stop");
    assert!(begun.elapsed() < Duration::from_secs(2));

    let record = registry.get_machine("alpha").await.expect("get");
    assert_eq!(record.status, MachineStatus::Stopped);
}

#[tokio::test]
async fn delete_while_running_stops_first_and_removes_dirs() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dirs = MachineDirs::with_root(tmp.path());
    let (paths, pid_file) = fake_qemu(tmp.path());
    let registry = MachineRegistry::new(dirs.clone()).with_qemu_paths(paths);

    registry
        .add_machine(alpha(), false, String::new())
        .await
        .expect("add");
    serve_control_sockets(&dirs.machine_state_dir("alpha"), pid_file);
    registry.start_machine("alpha").await.expect("start");

    registry.delete_machine("alpha").await.expect("delete");

    assert!(!dirs.machine_config_dir("alpha").exists());
    assert!(!dirs.machine_data_dir("alpha").exists());
    assert!(!dirs.machine_state_dir("alpha").exists());
    assert!(registry.get_machine("alpha").await.is_err());
}

#[tokio::test]
async fn spontaneous_child_exit_flips_the_record_to_stopped() {
    let tmp = tempfile::tempdir().expect("tempdir");
    let dirs = MachineDirs::with_root(tmp.path());
    let (paths, pid_file) = fake_qemu(tmp.path());
    let registry = MachineRegistry::new(dirs.clone()).with_qemu_paths(paths);

    registry
        .add_machine(alpha(), false, String::new())
        .await
        .expect("add");
    serve_control_sockets(&dirs.machine_state_dir("alpha"), pid_file.clone());
    registry.start_machine("alpha").await.expect("start");

    // the "guest" dies on its own
    let pid = std::fs::read_to_string(&pid_file).expect("pid");
    tokio::process::Command::new("kill")
        .arg(pid.trim())
        .status()
        .await
        .expect("kill");

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let record = registry.get_machine("alpha").await.expect("get");
        if record.status == MachineStatus::Stopped {
            break;
        }
        assert!(Instant::now() < deadline, "machine never flipped to stopped");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}
