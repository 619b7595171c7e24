//! Test doubles for the registry: an in-memory image tool and a launcher
//! that runs `sleep` through the real supervisor.

use crate::config::schema::DiskFormat;
use crate::error::{Error, Result};
use crate::vm::disk::{ImageTool, SnapshotEntry};
use crate::vm::network::PrivilegedHelper;
use crate::vm::process::{self, Launcher, ProcessSpec};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};

/// Writes small placeholder files and keeps snapshot tables in memory.
#[derive(Default)]
pub(crate) struct FakeImageTool {
    backing: Mutex<HashMap<PathBuf, PathBuf>>,
    snapshots: Mutex<HashMap<PathBuf, Vec<SnapshotEntry>>>,
    pub(crate) applied: Mutex<Vec<(PathBuf, String)>>,
}

impl ImageTool for FakeImageTool {
    fn create(&self, path: &Path, format: DiskFormat, size_gb: u32) -> Result<()> {
        fs::write(path, format!("{} {size_gb}G", format.as_str())).map_err(|e| Error::io_at(path, e))
    }

    fn create_overlay(&self, backing: &Path, path: &Path) -> Result<()> {
        if !backing.exists() {
            return Err(Error::CommandFailed {
                command: "qemu-img create".into(),
                stderr: format!("Could not open '{}'", backing.display()),
            });
        }
        fs::write(path, "overlay").map_err(|e| Error::io_at(path, e))?;
        self.backing
            .lock()
            .insert(path.to_path_buf(), backing.to_path_buf());
        Ok(())
    }

    fn convert(&self, src: &Path, dst: &Path) -> Result<()> {
        fs::copy(src, dst).map_err(|e| Error::io_at(dst, e))?;
        Ok(())
    }

    fn backing_file(&self, path: &Path) -> Result<Option<PathBuf>> {
        Ok(self.backing.lock().get(path).cloned())
    }

    fn snapshot_create(&self, disk: &Path, tag: &str) -> Result<()> {
        let mut all = self.snapshots.lock();
        let list = all.entry(disk.to_path_buf()).or_default();
        list.push(SnapshotEntry {
            id: (list.len() + 1).to_string(),
            tag: tag.to_string(),
            vm_size: "0 B".into(),
            date: "2024-01-01 00:00:00".into(),
        });
        Ok(())
    }

    fn snapshot_apply(&self, disk: &Path, tag: &str) -> Result<()> {
        self.applied
            .lock()
            .push((disk.to_path_buf(), tag.to_string()));
        Ok(())
    }

    fn snapshot_delete(&self, disk: &Path, tag: &str) -> Result<()> {
        let mut all = self.snapshots.lock();
        let list = all.entry(disk.to_path_buf()).or_default();
        let before = list.len();
        list.retain(|s| s.tag != tag);
        if list.len() == before {
            return Err(Error::CommandFailed {
                command: "qemu-img snapshot -d".into(),
                stderr: format!("Could not delete snapshot '{tag}'"),
            });
        }
        Ok(())
    }

    fn snapshot_list(&self, disk: &Path) -> Result<Vec<SnapshotEntry>> {
        Ok(self.snapshots.lock().get(disk).cloned().unwrap_or_default())
    }
}

/// Runs `sleep 30` in place of the hypervisor, keeping the log, pidfile and
/// inherited fds of the real spec. Records the argv it was asked to run.
#[derive(Default)]
pub(crate) struct SleepLauncher {
    pub(crate) fail: bool,
    pub(crate) last_args: Mutex<Vec<String>>,
}

impl SleepLauncher {
    pub(crate) fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }
}

impl Launcher for SleepLauncher {
    fn launch(&self, mut spec: ProcessSpec) -> Result<u32> {
        *self.last_args.lock() = std::mem::take(&mut spec.args);
        spec.child_writes_pidfile = false;
        if self.fail {
            spec.program = PathBuf::from("sh");
            spec.args = vec!["-c".into(), "echo 'could not open disk' >&2; exit 1".into()];
        } else {
            spec.program = PathBuf::from("sleep");
            spec.args = vec!["30".into()];
        }
        process::start(spec)
    }
}

/// Host without macvtap support: no links, every change refused.
#[derive(Default)]
pub(crate) struct NoLinks;

impl PrivilegedHelper for NoLinks {
    fn delete_link(&self, name: &str) -> Result<()> {
        Err(Error::Configuration(format!("cannot delete {name} in tests")))
    }

    fn create_macvtap(&self, _parent: &str, name: &str, _mac: &str) -> Result<()> {
        Err(Error::Configuration(format!("cannot create {name} in tests")))
    }

    fn open_tap(&self, name: &str) -> Result<OwnedFd> {
        Err(Error::Configuration(format!("cannot open {name} in tests")))
    }

    fn list_links(&self) -> Result<Vec<String>> {
        Ok(Vec::new())
    }
}

/// A websockify stand-in that idles until killed.
pub(crate) fn fake_websockify(dir: &Path) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;
    let bin = dir.join("websockify");
    fs::write(&bin, "#!/bin/sh\nexec sleep 30\n").unwrap();
    fs::set_permissions(&bin, fs::Permissions::from_mode(0o755)).unwrap();
    bin
}
