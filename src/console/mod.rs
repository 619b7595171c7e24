//! Remote console access: VNC through websockify, SPICE bridged in-process.

pub mod server;
pub mod spice;
pub mod vnc;

pub use server::{ConsoleServer, SpiceTargets, StaticToken, TokenVerifier};
pub use spice::SpiceSessions;
pub use vnc::{VncProxy, VncProxyManager};

use crate::config::Settings;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Owns every console session on the host.
pub struct ProxyManager {
    pub vnc: VncProxyManager,
    pub spice: Arc<SpiceSessions>,
}

impl ProxyManager {
    pub fn new(settings: &Settings) -> Self {
        Self {
            vnc: VncProxyManager::new(
                settings.websockify.clone(),
                settings.novnc_dir.clone(),
                settings.proxies_dir.clone(),
            ),
            spice: Arc::new(SpiceSessions::default()),
        }
    }

    /// Close everything attached to one VM.
    pub fn teardown_vm(&self, vm_id: &str) {
        if let Err(e) = self.vnc.stop(vm_id) {
            tracing::warn!(vm_id, error = %e, "failed to stop vnc proxy");
        }
        let n = self.spice.cancel_vm(vm_id);
        if n > 0 {
            tracing::info!(vm_id, sessions = n, "closed spice consoles");
        }
    }

    pub fn active_ports(&self) -> HashSet<u16> {
        self.vnc.active_ports()
    }

    /// `claimed` maps VM ids to the bridge pid their record names.
    pub fn sweep_orphans(&self, claimed: &HashMap<String, u32>) -> usize {
        let n = self.vnc.sweep_orphans(claimed);
        if n > 0 {
            tracing::info!(count = n, "cleaned up orphan vnc proxies");
        }
        n
    }

    /// Stop every proxy process this process started and close every
    /// SPICE bridge.
    pub fn shutdown(&self) {
        self.vnc.stop_all();
        self.spice.cancel_all();
    }
}
