//! noVNC access through one websockify process per VM.
//!
//! The pid file under the proxies directory names the process that owns a
//! VM's bridge, whichever process started it. The in-memory map only
//! remembers what this process started, so shutdown can stop those.

use crate::error::{Error, Result};
use crate::vm::process::{self, ProcessSpec};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const STOP_GRACE: Duration = Duration::from_secs(5);

/// A live websockify bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct VncProxy {
    pub ws_port: u16,
    pub pid: u32,
    pub vnc_port: u16,
}

pub struct VncProxyManager {
    websockify: PathBuf,
    novnc_dir: PathBuf,
    proxies_dir: PathBuf,
    sessions: Mutex<HashMap<String, VncProxy>>,
    /// Serialises start and stop so one VM never gets two bridges.
    ops: Mutex<()>,
}

impl VncProxyManager {
    pub fn new(websockify: PathBuf, novnc_dir: PathBuf, proxies_dir: PathBuf) -> Self {
        Self {
            websockify,
            novnc_dir,
            proxies_dir,
            sessions: Mutex::new(HashMap::new()),
            ops: Mutex::new(()),
        }
    }

    fn pidfile(&self, vm_id: &str) -> PathBuf {
        self.proxies_dir.join(format!("{vm_id}.pid"))
    }

    /// The VM's proxy if its process is alive and still owns the pid file.
    /// `recorded` is the bridge the registry knows about, possibly started
    /// by another process. Dead entries are dropped on the way.
    pub fn status(&self, vm_id: &str, recorded: Option<VncProxy>) -> Option<VncProxy> {
        let pidfile = self.pidfile(vm_id);
        let owner = process::read_pidfile(&pidfile);
        let tracked = self.sessions.lock().get(vm_id).copied();
        let live = [tracked, recorded]
            .into_iter()
            .flatten()
            .find(|p| owner == Some(p.pid) && process::is_running(p.pid));
        if live.is_some() {
            return live;
        }
        if let Some(gone) = self.sessions.lock().remove(vm_id) {
            tracing::info!(vm_id, pid = gone.pid, "vnc proxy exited");
        }
        if owner.map_or(true, |pid| !process::is_running(pid)) {
            remove_quietly(&pidfile);
        }
        None
    }

    /// Reuse a healthy proxy pointing at `vnc_port`, else stop whatever
    /// holds the VM's pid file and start one on the port `ws_port` picks.
    pub fn ensure(
        &self,
        vm_id: &str,
        vnc_port: u16,
        recorded: Option<VncProxy>,
        ws_port: impl FnOnce() -> Result<u16>,
    ) -> Result<VncProxy> {
        let _op = self.ops.lock();
        if let Some(existing) = self.status(vm_id, recorded) {
            if existing.vnc_port == vnc_port {
                return Ok(existing);
            }
        }
        self.stop_locked(vm_id)?;

        let ws_port = ws_port()?;
        fs::create_dir_all(&self.proxies_dir).map_err(|e| Error::io_at(&self.proxies_dir, e))?;
        let spec = ProcessSpec::new(
            &self.websockify,
            self.proxies_dir.join(format!("{vm_id}.log")),
            self.pidfile(vm_id),
        )
        .args([
            "--web".to_string(),
            self.novnc_dir.display().to_string(),
            "--timeout".into(),
            "0".into(),
            "--idle-timeout".into(),
            "0".into(),
            ws_port.to_string(),
            format!("localhost:{vnc_port}"),
        ]);
        let pid = process::start(spec)?;
        let proxy = VncProxy {
            ws_port,
            pid,
            vnc_port,
        };
        self.sessions.lock().insert(vm_id.to_string(), proxy);
        tracing::info!(vm_id, ws_port, vnc_port, pid, "vnc proxy started");
        Ok(proxy)
    }

    /// Stop the VM's proxy, whether this process or another one started
    /// it. Returns whether a live process was stopped.
    pub fn stop(&self, vm_id: &str) -> Result<bool> {
        let _op = self.ops.lock();
        self.stop_locked(vm_id)
    }

    fn stop_locked(&self, vm_id: &str) -> Result<bool> {
        let pidfile = self.pidfile(vm_id);
        let tracked = self.sessions.lock().remove(vm_id).map(|p| p.pid);
        let mut pids: Vec<u32> = tracked
            .into_iter()
            .chain(process::read_pidfile(&pidfile))
            .collect();
        pids.dedup();

        let mut stopped = false;
        for pid in pids.into_iter().filter(|p| process::is_running(*p)) {
            process::stop(pid, STOP_GRACE)?;
            if process::is_running(pid) {
                return Err(Error::InvalidState(format!(
                    "vnc proxy {pid} of vm {vm_id} did not exit"
                )));
            }
            tracing::info!(vm_id, pid, "vnc proxy stopped");
            stopped = true;
        }
        remove_quietly(&pidfile);
        Ok(stopped)
    }

    /// Websocket ports held by proxies this process started.
    pub fn active_ports(&self) -> HashSet<u16> {
        self.sessions.lock().values().map(|p| p.ws_port).collect()
    }

    /// Kill bridges nobody owns: a live pid in a pid file is left alone
    /// only when `claimed` (the registry's view) or this process's own
    /// sessions name the same pid for that VM. Files of dead pids go too.
    pub fn sweep_orphans(&self, claimed: &HashMap<String, u32>) -> usize {
        let _op = self.ops.lock();
        let Ok(entries) = fs::read_dir(&self.proxies_dir) else {
            return 0;
        };
        let tracked: HashMap<String, u32> = self
            .sessions
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.pid))
            .collect();

        let mut killed = 0;
        for path in entries.flatten().map(|e| e.path()) {
            if path.extension().and_then(|e| e.to_str()) != Some("pid") {
                continue;
            }
            let Some(vm_id) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let pid = process::read_pidfile(&path);
            if let Some(pid) = pid.filter(|p| process::is_running(*p)) {
                let owned = claimed.get(vm_id) == Some(&pid) || tracked.get(vm_id) == Some(&pid);
                if owned {
                    continue;
                }
                if let Err(e) = process::stop(pid, STOP_GRACE) {
                    tracing::warn!(vm_id, pid, error = %e, "failed to stop orphan vnc proxy");
                    continue;
                }
                if process::is_running(pid) {
                    tracing::warn!(vm_id, pid, "orphan vnc proxy survived SIGKILL");
                    continue;
                }
                tracing::info!(vm_id, pid, "stopped orphan vnc proxy");
                killed += 1;
            }
            self.sessions.lock().remove(vm_id);
            remove_quietly(&path);
        }
        killed
    }

    /// Stop every proxy this process started.
    pub fn stop_all(&self) {
        let ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.stop(&id) {
                tracing::warn!(vm_id = %id, error = %e, "failed to stop vnc proxy");
            }
        }
    }
}

fn remove_quietly(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(path = %path.display(), error = %e, "failed to remove pid file");
        }
    }
}
