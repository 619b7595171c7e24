//! Software TPM (swtpm) per VM.

use crate::error::{Error, Result};
use crate::vm::process::{self, ProcessSpec};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

const SOCKET_WAIT: Duration = Duration::from_secs(2);

pub fn ctrl_socket(vm_dir: &Path) -> PathBuf {
    vm_dir.join("swtpm.sock")
}

pub fn pidfile(vm_dir: &Path) -> PathBuf {
    vm_dir.join("swtpm.pid")
}

/// Start swtpm for the VM in `vm_dir`, reusing a live instance. Returns the
/// control socket QEMU should connect to.
pub fn start(swtpm: &Path, vm_dir: &Path) -> Result<PathBuf> {
    let socket = ctrl_socket(vm_dir);
    let pidfile = pidfile(vm_dir);
    if process::read_pidfile(&pidfile).is_some_and(process::is_running) && socket.exists() {
        return Ok(socket);
    }

    let state_dir = vm_dir.join("tpm");
    fs::create_dir_all(&state_dir).map_err(|e| Error::io_at(&state_dir, e))?;
    let _ = fs::remove_file(&socket);

    let mut spec = ProcessSpec::new(swtpm, vm_dir.join("swtpm.log"), pidfile.clone()).args([
        "socket".to_string(),
        "--tpmstate".into(),
        format!("dir={}", state_dir.display()),
        "--ctrl".into(),
        format!("type=unixio,path={}", socket.display()),
        "--tpm2".into(),
        "--pid".into(),
        format!("file={}", pidfile.display()),
    ]);
    spec.child_writes_pidfile = true;
    let pid = process::start(spec)?;

    let deadline = Instant::now() + SOCKET_WAIT;
    while !socket.exists() {
        if Instant::now() >= deadline {
            let _ = process::stop(pid, Duration::from_secs(1));
            return Err(Error::ProcessStartFailed {
                command: swtpm.display().to_string(),
                log_excerpt: format!("control socket {} never appeared", socket.display()),
            });
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    tracing::info!(pid, socket = %socket.display(), "swtpm started");
    Ok(socket)
}

/// Stop the VM's swtpm if one is running.
pub fn stop(vm_dir: &Path) -> Result<()> {
    process::stop_pidfile(&pidfile(vm_dir), Duration::from_secs(5))?;
    let _ = fs::remove_file(ctrl_socket(vm_dir));
    Ok(())
}
