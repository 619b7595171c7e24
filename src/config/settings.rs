//! Host-level settings: where state lives and which tools to run.

use crate::error::Result;
use crate::utils::paths::qvmd_home;
use crate::utils::system::{find_tool, pick_qemu_bin};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Resolved host settings shared by every component.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Root of all persisted state.
    pub root: PathBuf,
    /// One directory per VM, keyed by id.
    pub vms_dir: PathBuf,
    pub volumes_dir: PathBuf,
    /// Pid and log files of websocket bridge processes.
    pub proxies_dir: PathBuf,
    pub backups_dir: PathBuf,
    pub iso_dir: PathBuf,
    pub qemu_bin: PathBuf,
    pub qemu_img: PathBuf,
    pub websockify: PathBuf,
    pub novnc_dir: PathBuf,
    pub swtpm: Option<PathBuf>,
    pub bridge_conf: PathBuf,
    pub bridge_helper: PathBuf,
    /// Driver/tool media auto-mounted read-only for Windows guests.
    pub guest_tools_iso: PathBuf,
    /// Grace period between SIGTERM and SIGKILL when stopping QEMU.
    pub stop_grace: Duration,
    /// Period of the maintenance sweep.
    pub sweep_interval: Duration,
}

impl Settings {
    /// Settings rooted at `root`, with tool paths resolved from `PATH` and
    /// the `QVMD_*` environment overrides.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let env_path = |key: &str| std::env::var_os(key).map(PathBuf::from);

        let iso_dir = env_path("QVMD_ISO_DIR").unwrap_or_else(|| root.join("isos"));
        Self {
            vms_dir: root.join("vms"),
            volumes_dir: root.join("volumes"),
            proxies_dir: root.join("proxies"),
            backups_dir: root.join("backups"),
            guest_tools_iso: iso_dir.join("virtio-win.iso"),
            iso_dir,
            qemu_bin: env_path("QVMD_QEMU_BIN").unwrap_or_else(|| {
                pick_qemu_bin(std::env::consts::ARCH)
                    .unwrap_or_else(|_| PathBuf::from("qemu-system-x86_64"))
            }),
            qemu_img: env_path("QVMD_QEMU_IMG").unwrap_or_else(|| find_tool(&["qemu-img"])),
            websockify: env_path("QVMD_WEBSOCKIFY").unwrap_or_else(|| find_tool(&["websockify"])),
            novnc_dir: env_path("QVMD_NOVNC_DIR")
                .unwrap_or_else(|| PathBuf::from("/usr/share/novnc")),
            swtpm: which::which("swtpm").ok(),
            bridge_conf: PathBuf::from("/etc/qemu/bridge.conf"),
            bridge_helper: bridge_helper_path(),
            stop_grace: Duration::from_secs(10),
            sweep_interval: Duration::from_secs(300),
            root,
        }
    }

    /// Settings under `$QVMD_HOME` (default `~/qvmd`).
    pub fn from_env() -> Result<Self> {
        Ok(Self::with_root(qvmd_home()?))
    }

    /// Create every state directory.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.root,
            &self.vms_dir,
            &self.volumes_dir,
            &self.proxies_dir,
            &self.backups_dir,
        ] {
            std::fs::create_dir_all(dir)
                .map_err(|e| crate::error::Error::io_at(dir.as_path(), e))?;
        }
        Ok(())
    }

    pub fn vm_dir(&self, id: &str) -> PathBuf {
        self.vms_dir.join(id)
    }

    pub fn vms_table(&self) -> PathBuf {
        self.root.join("vms.json")
    }

    pub fn volumes_table(&self) -> PathBuf {
        self.root.join("volumes.json")
    }

    /// Guest agent socket inside a VM directory.
    pub fn qga_socket(vm_dir: &Path) -> PathBuf {
        vm_dir.join("qga.sock")
    }
}

fn bridge_helper_path() -> PathBuf {
    [
        "/usr/lib/qemu/qemu-bridge-helper",
        "/usr/libexec/qemu-bridge-helper",
        "/usr/lib/qemu-bridge-helper",
    ]
    .iter()
    .map(PathBuf::from)
    .find(|p| p.exists())
    .unwrap_or_else(|| PathBuf::from("/usr/lib/qemu/qemu-bridge-helper"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_layout_under_root() {
        let tmp = TempDir::new().unwrap();
        let s = Settings::with_root(tmp.path());
        assert_eq!(s.vms_table(), tmp.path().join("vms.json"));
        assert_eq!(s.vm_dir("abc"), tmp.path().join("vms").join("abc"));
        s.ensure_dirs().unwrap();
        assert!(s.proxies_dir.is_dir());
        assert!(s.backups_dir.is_dir());
    }
}
