//! VM registry: the lifecycle state machine over the persisted tables.
//!
//! Status is re-derived from the recorded pid on every read. Port and MAC
//! allocation happen inside the same store mutation that persists the
//! record, so concurrent callers never share a resource.

use crate::agent::{collect_guest_info, ExecOutput, GuestAgent, GuestInfo, GuestShell};
use crate::config::schema::{
    validate_cpus, validate_memory, validate_name, CloneVm, CreateSnapshot, CreateVm,
    CreateVolume, DiskFormat, NetworkConfig, NetworkMode, OsType, Snapshot, SnapshotMeta, UpdateVm,
    VmRecord, VmStatus, Volume,
};
use crate::config::Settings;
use crate::console::{ProxyManager, SpiceTargets, VncProxy};
use crate::error::{Error, PortCategory, Result};
use crate::utils::system::{free_space, now_utc, run_tool, tail_file};
use crate::vm::allocator::{allocate_port, macvtap_prefix, unique_mac};
use crate::vm::backup::{self, BackupInfo, RECORD_MEMBER};
use crate::vm::builder::{self, HostEnv};
use crate::vm::cloudinit::{self, CloudInitConfig};
use crate::vm::disk::{validate_tag, ImageTool, QemuImg};
use crate::vm::firmware;
use crate::vm::metrics::{MetricsSampler, VmMetrics};
use crate::vm::network::{self, BridgeSetup, IpCommandHelper, PrivilegedHelper};
use crate::vm::process::{self, Launcher, ProcessSpec, Supervisor};
use crate::vm::store::{Store, Tables};
use crate::vm::tpm;
use crate::vm::{DISK_FILE, EFI_VARS_FILE, QEMU_LOG, QEMU_PIDFILE};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

const RESTART_SETTLE: Duration = Duration::from_secs(1);
const LOG_TAIL_BYTES: u64 = 64 * 1024;
const MIN_FREE_GB: f64 = 5.0;

/// External collaborators of the registry.
#[derive(Clone)]
pub struct Backends {
    pub image: Arc<dyn ImageTool>,
    pub launcher: Arc<dyn Launcher>,
    pub net_helper: Arc<dyn PrivilegedHelper>,
}

impl Backends {
    /// qemu-img, the process supervisor and `ip` through sudo.
    pub fn system(settings: &Settings) -> Self {
        Self {
            image: Arc::new(QemuImg::new(&settings.qemu_img)),
            launcher: Arc::new(Supervisor),
            net_helper: Arc::new(IpCommandHelper::default()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VncConnection {
    pub vm_id: String,
    pub vnc_port: u16,
    pub ws_port: u16,
    pub pid: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpiceConnection {
    pub vm_id: String,
    pub host: String,
    pub spice_port: u16,
    pub ws_path: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct IsoFile {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HostHealth {
    pub healthy: bool,
    pub qemu: HealthCheck,
    pub kvm: HealthCheck,
    pub disk: HealthCheck,
}

pub struct VmManager {
    settings: Settings,
    store: Store,
    backends: Backends,
    proxies: ProxyManager,
    metrics: MetricsSampler,
}

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Short id used both as snapshot id and as the image's snapshot tag.
fn new_snapshot_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Status and pid as the process table sees them. Transitional states
/// belong to an operation in flight and are left alone.
fn observed(vm: &VmRecord) -> (VmStatus, Option<u32>) {
    match vm.pid {
        Some(pid) if process::is_running(pid) => match vm.status {
            VmStatus::Starting | VmStatus::Stopping => (vm.status, Some(pid)),
            _ => (VmStatus::Running, Some(pid)),
        },
        Some(_) => (VmStatus::Stopped, None),
        None if vm.status == VmStatus::Running => (VmStatus::Stopped, None),
        None => (vm.status, None),
    }
}

fn require_stopped(vm: &VmRecord, action: &str) -> Result<()> {
    match vm.status {
        VmStatus::Stopped | VmStatus::Error => Ok(()),
        other => Err(Error::InvalidState(format!(
            "vm {} is {other}; stop it before {action}",
            vm.name
        ))),
    }
}

fn require_running(vm: &VmRecord) -> Result<()> {
    if vm.status != VmStatus::Running {
        return Err(Error::InvalidState(format!(
            "vm {} is not running",
            vm.name
        )));
    }
    Ok(())
}

/// The websockify bridge the record names, if any.
fn recorded_proxy(vm: &VmRecord) -> Option<VncProxy> {
    Some(VncProxy {
        ws_port: vm.ws_port?,
        pid: vm.ws_proxy_pid?,
        vnc_port: vm.vnc_port,
    })
}

fn validate_iso(path: &Path) -> Result<()> {
    if !path.is_file() {
        return Err(Error::Validation(format!(
            "iso not found: {}",
            path.display()
        )));
    }
    Ok(())
}

/// Fill ids and MACs, validate interface names and MACs.
fn normalize_networks(networks: &mut [NetworkConfig]) -> Result<()> {
    let mut taken = HashSet::new();
    for net in networks.iter() {
        if let Some(mac) = &net.mac {
            network::validate_mac(mac)?;
            if !taken.insert(mac.to_ascii_lowercase()) {
                return Err(Error::Validation(format!("duplicate mac address {mac}")));
            }
        }
    }
    for (idx, net) in networks.iter_mut().enumerate() {
        if net.id.is_empty() {
            net.id = format!("net{idx}");
        }
        match &net.mode {
            NetworkMode::Bridge { bridge } => network::validate_iface_name(bridge)?,
            NetworkMode::Macvtap { parent } => network::validate_iface_name(parent)?,
            NetworkMode::Nat { .. } | NetworkMode::Isolated => {}
        }
        if net.mac.is_none() {
            let mac = unique_mac(&taken);
            taken.insert(mac.clone());
            net.mac = Some(mac);
        }
    }
    Ok(())
}

/// Fresh MACs on every interface.
fn regenerate_macs(networks: &mut [NetworkConfig]) -> Result<()> {
    for net in networks.iter_mut() {
        net.mac = None;
    }
    normalize_networks(networks)
}

/// VNC and SPICE ports not held by any record nor bound on the host.
fn allocate_console_ports(tables: &Tables) -> Result<(u16, u16)> {
    let used: HashSet<u16> = tables
        .vms
        .values()
        .flat_map(|vm| [vm.vnc_port, vm.spice_port])
        .collect();
    let vnc = allocate_port(PortCategory::Vnc, &used)?;
    let spice = allocate_port(PortCategory::Spice, &used)?;
    Ok((vnc, spice))
}

impl VmManager {
    pub fn new(settings: Settings) -> Result<Self> {
        let backends = Backends::system(&settings);
        Self::with_backends(settings, backends)
    }

    pub fn with_backends(settings: Settings, backends: Backends) -> Result<Self> {
        settings.ensure_dirs()?;
        let store = Store::open(settings.vms_table(), settings.volumes_table())?;
        let proxies = ProxyManager::new(&settings);
        Ok(Self {
            settings,
            store,
            backends,
            proxies,
            metrics: MetricsSampler::default(),
        })
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn proxies(&self) -> &ProxyManager {
        &self.proxies
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    /// Persist re-derived statuses. VMs found dead lose their consoles.
    fn refresh(&self) -> Result<()> {
        let stale: Vec<String> = self.store.read(|t| {
            t.vms
                .values()
                .filter(|vm| observed(vm) != (vm.status, vm.pid))
                .map(|vm| vm.id.clone())
                .collect()
        });
        if stale.is_empty() {
            return Ok(());
        }
        let died = self.store.mutate(|t| {
            let mut died = Vec::new();
            for id in &stale {
                let Some(vm) = t.vms.get_mut(id) else { continue };
                let (status, pid) = observed(vm);
                if status == vm.status && pid == vm.pid {
                    continue;
                }
                tracing::info!(vm_id = %id, from = %vm.status, to = %status, "vm status changed");
                if status == VmStatus::Stopped {
                    vm.clear_proxies();
                    died.push(id.clone());
                }
                vm.status = status;
                vm.pid = pid;
            }
            Ok(died)
        })?;
        for id in died {
            self.proxies.teardown_vm(&id);
        }
        Ok(())
    }

    pub fn get_vm(&self, id: &str) -> Result<VmRecord> {
        self.refresh()?;
        self.store.read(|t| t.vm(id).cloned())
    }

    pub fn list_vms(&self) -> Result<Vec<VmRecord>> {
        self.refresh()?;
        Ok(self.store.read(|t| t.vms.values().cloned().collect()))
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    pub fn create_vm(&self, req: CreateVm) -> Result<VmRecord> {
        req.validate()?;
        for iso in [&req.iso_path, &req.secondary_iso_path].into_iter().flatten() {
            validate_iso(iso)?;
        }
        let mut networks = req.networks.clone();
        normalize_networks(&mut networks)?;

        let id = new_id();
        let vm_dir = self.settings.vm_dir(&id);
        fs::create_dir_all(&vm_dir).map_err(|e| Error::io_at(&vm_dir, e))?;
        let disk_path = vm_dir.join(DISK_FILE);

        let result = self
            .backends
            .image
            .create(&disk_path, DiskFormat::Qcow2, req.disk_size)
            .and_then(|()| {
                self.store.mutate(|t| {
                    let (vnc_port, spice_port) = allocate_console_ports(t)?;
                    let vm = VmRecord {
                        id: id.clone(),
                        name: req.name,
                        memory: req.memory,
                        cpus: req.cpus,
                        disk_size: req.disk_size,
                        disk_path,
                        iso_path: req.iso_path,
                        secondary_iso_path: req.secondary_iso_path,
                        os_type: req.os_type,
                        vnc_port,
                        spice_port,
                        ws_port: None,
                        ws_proxy_pid: None,
                        status: VmStatus::Stopped,
                        pid: None,
                        networks,
                        volumes: Vec::new(),
                        boot_order: req.boot_order,
                        cpu_model: req.cpu_model,
                        display: req.display,
                        uefi: req.uefi,
                        tpm: req.tpm,
                        snapshots: Default::default(),
                        created_at: now_utc(),
                    };
                    t.vms.insert(id.clone(), vm.clone());
                    Ok(vm)
                })
            });

        match result {
            Ok(vm) => {
                tracing::info!(vm_id = %vm.id, name = %vm.name, vnc_port = vm.vnc_port, spice_port = vm.spice_port, "vm created");
                Ok(vm)
            }
            Err(e) => {
                tracing::error!(vm_id = %id, error = %e, "vm create failed");
                let _ = fs::remove_dir_all(&vm_dir);
                Err(e)
            }
        }
    }

    pub fn start_vm(&self, id: &str) -> Result<VmRecord> {
        self.refresh()?;
        let (vm, volumes) = self.store.mutate(|t| {
            let vm = t.vm_mut(id)?;
            match vm.status {
                VmStatus::Stopped | VmStatus::Error => {}
                VmStatus::Running => {
                    return Err(Error::InvalidState(format!(
                        "vm {} is already running",
                        vm.name
                    )))
                }
                other => {
                    return Err(Error::InvalidState(format!("vm {} is {other}", vm.name)))
                }
            }
            vm.status = VmStatus::Starting;
            let vm = vm.clone();
            let volumes = vm
                .volumes
                .iter()
                .map(|v| t.volume(v).cloned())
                .collect::<Result<Vec<_>>>()?;
            Ok((vm, volumes))
        })?;

        match self.launch(&vm, &volumes) {
            Ok(pid) => {
                let vm = self.store.mutate(|t| {
                    let vm = t.vm_mut(id)?;
                    vm.status = VmStatus::Running;
                    vm.pid = Some(pid);
                    Ok(vm.clone())
                })?;
                tracing::info!(vm_id = %id, pid, "vm started");
                Ok(vm)
            }
            Err(e) => {
                tracing::error!(vm_id = %id, error = %e, "vm start failed");
                self.release_host_resources(id);
                if let Err(err) = self.store.mutate(|t| {
                    let vm = t.vm_mut(id)?;
                    vm.status = VmStatus::Error;
                    vm.pid = None;
                    Ok(())
                }) {
                    tracing::error!(vm_id = %id, error = %err, "failed to record start failure");
                }
                Err(e)
            }
        }
    }

    fn launch(&self, vm: &VmRecord, volumes: &[Volume]) -> Result<u32> {
        let vm_dir = self.settings.vm_dir(&vm.id);
        fs::create_dir_all(&vm_dir).map_err(|e| Error::io_at(&vm_dir, e))?;

        let mut host = HostEnv::detect(&self.settings, vm);
        if let Some(fw) = host.firmware.as_ref().filter(|_| vm.uefi) {
            firmware::ensure_vars(fw, &vm_dir.join(EFI_VARS_FILE))?;
        }
        if vm.tpm {
            match &self.settings.swtpm {
                Some(swtpm) => host.tpm_socket = Some(tpm::start(swtpm, &vm_dir)?),
                None => tracing::warn!(vm_id = %vm.id, "swtpm not installed; starting without a tpm"),
            }
        }

        let bridge = BridgeSetup {
            conf: self.settings.bridge_conf.clone(),
            helper: self.settings.bridge_helper.clone(),
        };
        let plan = network::prepare(
            &vm.id,
            &vm.networks,
            self.backends.net_helper.as_ref(),
            &bridge,
        )?;
        let args = builder::build_args(vm, volumes, &vm_dir, &host, &plan.args)?;

        let _ = fs::remove_file(Settings::qga_socket(&vm_dir));
        let mut spec = ProcessSpec::new(
            &self.settings.qemu_bin,
            vm_dir.join(QEMU_LOG),
            vm_dir.join(QEMU_PIDFILE),
        )
        .args(args);
        spec.cwd = Some(vm_dir);
        spec.child_writes_pidfile = true;
        spec.fds = plan.fds;
        self.backends.launcher.launch(spec)
    }

    /// Tear down what a VM holds on the host besides its QEMU process.
    fn release_host_resources(&self, id: &str) {
        let vm_dir = self.settings.vm_dir(id);
        self.proxies.teardown_vm(id);
        self.metrics.forget(id);
        if let Err(e) = tpm::stop(&vm_dir) {
            tracing::warn!(vm_id = %id, error = %e, "failed to stop swtpm");
        }
        if let Err(e) = network::teardown(id, self.backends.net_helper.as_ref()) {
            tracing::warn!(vm_id = %id, error = %e, "failed to remove macvtap links");
        }
        let _ = fs::remove_file(vm_dir.join(QEMU_PIDFILE));
    }

    /// Idempotent: a stopped VM is returned untouched.
    pub fn stop_vm(&self, id: &str) -> Result<VmRecord> {
        self.refresh()?;
        let target = self.store.mutate(|t| {
            let vm = t.vm_mut(id)?;
            match vm.status {
                VmStatus::Stopped => return Ok(None),
                VmStatus::Starting | VmStatus::Stopping => {
                    return Err(Error::InvalidState(format!(
                        "vm {} is {}",
                        vm.name, vm.status
                    )))
                }
                VmStatus::Running | VmStatus::Error => {}
            }
            let previous = vm.status;
            vm.status = VmStatus::Stopping;
            Ok(Some((previous, vm.pid)))
        })?;
        let Some((previous, pid)) = target else {
            return self.store.read(|t| t.vm(id).cloned());
        };

        if let Some(pid) = pid {
            if let Err(e) = process::stop(pid, self.settings.stop_grace) {
                tracing::error!(vm_id = %id, pid, error = %e, "failed to stop qemu");
                let _ = self.store.mutate(|t| {
                    t.vm_mut(id)?.status = previous;
                    Ok(())
                });
                return Err(e);
            }
        }
        self.release_host_resources(id);

        let vm = self.store.mutate(|t| {
            let vm = t.vm_mut(id)?;
            vm.status = VmStatus::Stopped;
            vm.pid = None;
            vm.clear_proxies();
            Ok(vm.clone())
        })?;
        tracing::info!(vm_id = %id, "vm stopped");
        Ok(vm)
    }

    pub fn restart_vm(&self, id: &str) -> Result<VmRecord> {
        self.stop_vm(id)?;
        std::thread::sleep(RESTART_SETTLE);
        self.start_vm(id)
    }

    /// Copy-on-write clone of a stopped VM.
    pub fn clone_vm(&self, source_id: &str, req: CloneVm) -> Result<VmRecord> {
        validate_name(&req.name)?;
        if let Some(m) = req.memory {
            validate_memory(m)?;
        }
        if let Some(c) = req.cpus {
            validate_cpus(c)?;
        }
        let source = self.get_vm(source_id)?;
        require_stopped(&source, "cloning")?;

        let id = new_id();
        let vm_dir = self.settings.vm_dir(&id);
        fs::create_dir_all(&vm_dir).map_err(|e| Error::io_at(&vm_dir, e))?;
        let result = self.clone_into(&source, &id, &vm_dir, req);
        if let Err(e) = &result {
            tracing::error!(source = %source_id, error = %e, "vm clone failed");
            let _ = fs::remove_dir_all(&vm_dir);
        }
        result
    }

    fn clone_into(
        &self,
        source: &VmRecord,
        id: &str,
        vm_dir: &Path,
        req: CloneVm,
    ) -> Result<VmRecord> {
        let disk_path = vm_dir.join(DISK_FILE);
        self.backends
            .image
            .create_overlay(&source.disk_path, &disk_path)?;
        let source_vars = self.settings.vm_dir(&source.id).join(EFI_VARS_FILE);
        if source_vars.is_file() {
            let dest = vm_dir.join(EFI_VARS_FILE);
            fs::copy(&source_vars, &dest).map_err(|e| Error::io_at(&dest, e))?;
        }

        let mut networks = source.networks.clone();
        regenerate_macs(&mut networks)?;
        let vm = self.store.mutate(|t| {
            let (vnc_port, spice_port) = allocate_console_ports(t)?;
            let mut vm = source.clone();
            vm.id = id.to_string();
            vm.name = req.name;
            vm.memory = req.memory.unwrap_or(source.memory);
            vm.cpus = req.cpus.unwrap_or(source.cpus);
            vm.disk_path = disk_path;
            vm.vnc_port = vnc_port;
            vm.spice_port = spice_port;
            vm.clear_proxies();
            vm.status = VmStatus::Stopped;
            vm.pid = None;
            vm.networks = networks;
            vm.volumes = Vec::new();
            vm.snapshots.clear();
            vm.created_at = now_utc();
            t.vms.insert(vm.id.clone(), vm.clone());
            Ok(vm)
        })?;
        tracing::info!(vm_id = %vm.id, source = %source.id, "vm cloned");
        Ok(vm)
    }

    pub fn update_vm(&self, id: &str, update: UpdateVm) -> Result<VmRecord> {
        if let Some(name) = &update.name {
            validate_name(name)?;
        }
        if let Some(m) = update.memory {
            validate_memory(m)?;
        }
        if let Some(c) = update.cpus {
            validate_cpus(c)?;
        }
        for iso in [&update.iso_path, &update.secondary_iso_path]
            .into_iter()
            .flatten()
            .filter(|p| !p.as_os_str().is_empty())
        {
            validate_iso(iso)?;
        }
        let mut networks = update.networks;
        if let Some(nets) = networks.as_mut() {
            normalize_networks(nets)?;
        }

        self.refresh()?;
        let vm = self.store.mutate(|t| {
            let vm = t.vm_mut(id)?;
            require_stopped(vm, "updating it")?;
            if let Some(v) = update.name {
                vm.name = v;
            }
            if let Some(v) = update.memory {
                vm.memory = v;
            }
            if let Some(v) = update.cpus {
                vm.cpus = v;
            }
            if let Some(v) = update.iso_path {
                vm.iso_path = Some(v).filter(|p| !p.as_os_str().is_empty());
            }
            if let Some(v) = update.secondary_iso_path {
                vm.secondary_iso_path = Some(v).filter(|p| !p.as_os_str().is_empty());
            }
            if let Some(v) = update.os_type {
                vm.os_type = v;
            }
            if let Some(v) = networks {
                vm.networks = v;
            }
            if let Some(v) = update.boot_order {
                vm.boot_order = v;
            }
            if let Some(v) = update.cpu_model {
                vm.cpu_model = v;
            }
            if let Some(v) = update.display {
                vm.display = v;
            }
            if let Some(v) = update.uefi {
                vm.uefi = v;
            }
            if let Some(v) = update.tpm {
                vm.tpm = v;
            }
            Ok(vm.clone())
        })?;
        tracing::info!(vm_id = %id, "vm updated");
        Ok(vm)
    }

    /// VMs whose disk is an overlay on `id`'s disk.
    fn dependents(&self, id: &str) -> Vec<String> {
        let (base, others): (Option<PathBuf>, Vec<(String, PathBuf)>) = self.store.read(|t| {
            (
                t.vms.get(id).map(|vm| vm.disk_path.clone()),
                t.vms
                    .values()
                    .filter(|vm| vm.id != id)
                    .map(|vm| (vm.id.clone(), vm.disk_path.clone()))
                    .collect(),
            )
        });
        let Some(base) = base else { return Vec::new() };
        others
            .into_iter()
            .filter(|(_, disk)| {
                matches!(self.backends.image.backing_file(disk), Ok(Some(b)) if b == base)
            })
            .map(|(id, _)| id)
            .collect()
    }

    /// Stop, detach volumes, remove the directory and the record.
    pub fn delete_vm(&self, id: &str) -> Result<()> {
        let vm = self.get_vm(id)?;
        let clones = self.dependents(id);
        if !clones.is_empty() {
            return Err(Error::InvalidState(format!(
                "vm {} is the base image of clones {}; delete them first",
                vm.name,
                clones.join(", ")
            )));
        }
        if vm.status != VmStatus::Stopped {
            self.stop_vm(id)?;
        }
        self.proxies.teardown_vm(id);

        let vm_dir = self.settings.vm_dir(id);
        match fs::remove_dir_all(&vm_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_at(&vm_dir, e)),
        }
        self.store.mutate(|t| {
            t.vms.remove(id);
            for vol in t.volumes.values_mut() {
                if vol.attached_to.as_deref() == Some(id) {
                    vol.attached_to = None;
                }
            }
            Ok(())
        })?;
        tracing::info!(vm_id = %id, name = %vm.name, "vm deleted");
        Ok(())
    }

    pub fn vm_logs(&self, id: &str) -> Result<String> {
        self.store.read(|t| t.vm(id).map(|_| ()))?;
        Ok(tail_file(
            &self.settings.vm_dir(id).join(QEMU_LOG),
            LOG_TAIL_BYTES,
        ))
    }

    // ------------------------------------------------------------------
    // Volumes
    // ------------------------------------------------------------------

    pub fn create_volume(&self, req: CreateVolume) -> Result<Volume> {
        validate_name(&req.name)?;
        if !(1..=2048).contains(&req.size) {
            return Err(Error::Validation(format!(
                "volume size must be between 1 and 2048 GB, got {}",
                req.size
            )));
        }
        let id = new_id();
        let dir = &self.settings.volumes_dir;
        fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;
        let path = dir.join(format!("{id}.{}", req.format.as_str()));
        self.backends.image.create(&path, req.format, req.size)?;

        let volume = Volume {
            id: id.clone(),
            name: req.name,
            size: req.size,
            format: req.format,
            path: path.clone(),
            attached_to: None,
            created_at: now_utc(),
        };
        let stored = volume.clone();
        if let Err(e) = self.store.mutate(|t| {
            t.volumes.insert(id.clone(), stored);
            Ok(())
        }) {
            let _ = fs::remove_file(&path);
            return Err(e);
        }
        tracing::info!(volume_id = %id, size = volume.size, "volume created");
        Ok(volume)
    }

    pub fn list_volumes(&self) -> Vec<Volume> {
        self.store.read(|t| t.volumes.values().cloned().collect())
    }

    pub fn get_volume(&self, id: &str) -> Result<Volume> {
        self.store.read(|t| t.volume(id).cloned())
    }

    pub fn delete_volume(&self, id: &str) -> Result<()> {
        let volume = self.get_volume(id)?;
        if let Some(owner) = &volume.attached_to {
            return Err(Error::InvalidState(format!(
                "volume {} is attached to vm {owner}; detach it first",
                volume.name
            )));
        }
        match fs::remove_file(&volume.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::io_at(&volume.path, e)),
        }
        self.store.mutate(|t| {
            t.volumes.remove(id);
            Ok(())
        })?;
        tracing::info!(volume_id = %id, "volume deleted");
        Ok(())
    }

    pub fn attach_volume(&self, vm_id: &str, volume_id: &str) -> Result<VmRecord> {
        self.refresh()?;
        self.store.mutate(|t| {
            require_stopped(t.vm(vm_id)?, "attaching volumes")?;
            let volume = t.volume_mut(volume_id)?;
            match volume.attached_to.as_deref() {
                Some(owner) if owner == vm_id => {}
                Some(owner) => {
                    return Err(Error::AttachmentConflict {
                        volume: volume_id.to_string(),
                        owner: owner.to_string(),
                    })
                }
                None => volume.attached_to = Some(vm_id.to_string()),
            }
            let vm = t.vm_mut(vm_id)?;
            if !vm.volumes.iter().any(|v| v == volume_id) {
                vm.volumes.push(volume_id.to_string());
            }
            tracing::info!(vm_id, volume_id, "volume attached");
            Ok(vm.clone())
        })
    }

    pub fn detach_volume(&self, vm_id: &str, volume_id: &str) -> Result<VmRecord> {
        self.refresh()?;
        self.store.mutate(|t| {
            require_stopped(t.vm(vm_id)?, "detaching volumes")?;
            let volume = t.volume_mut(volume_id)?;
            if volume.attached_to.as_deref() != Some(vm_id) {
                return Err(Error::NotAttached {
                    volume: volume_id.to_string(),
                    vm: vm_id.to_string(),
                });
            }
            volume.attached_to = None;
            let vm = t.vm_mut(vm_id)?;
            vm.volumes.retain(|v| v != volume_id);
            tracing::info!(vm_id, volume_id, "volume detached");
            Ok(vm.clone())
        })
    }

    /// Make an attached volume the VM's primary disk, replacing the old one.
    pub fn promote_volume(&self, vm_id: &str, volume_id: &str) -> Result<VmRecord> {
        let vm = self.get_vm(vm_id)?;
        require_stopped(&vm, "promoting a volume")?;
        let volume = self.get_volume(volume_id)?;
        if volume.attached_to.as_deref() != Some(vm_id) {
            return Err(Error::NotAttached {
                volume: volume_id.to_string(),
                vm: vm_id.to_string(),
            });
        }

        match volume.format {
            DiskFormat::Qcow2 => {
                fs::rename(&volume.path, &vm.disk_path)
                    .map_err(|e| Error::io_at(&vm.disk_path, e))?;
            }
            DiskFormat::Raw => {
                let staged = vm.disk_path.with_extension("promote");
                self.backends.image.convert(&volume.path, &staged)?;
                fs::rename(&staged, &vm.disk_path).map_err(|e| Error::io_at(&vm.disk_path, e))?;
                let _ = fs::remove_file(&volume.path);
            }
        }

        let vm = self.store.mutate(|t| {
            t.volumes.remove(volume_id);
            let vm = t.vm_mut(vm_id)?;
            vm.volumes.retain(|v| v != volume_id);
            vm.disk_size = volume.size;
            vm.snapshots.clear();
            Ok(vm.clone())
        })?;
        tracing::info!(vm_id, volume_id, "volume promoted to primary disk");
        Ok(vm)
    }

    // ------------------------------------------------------------------
    // Snapshots
    // ------------------------------------------------------------------

    pub fn create_snapshot(&self, vm_id: &str, req: CreateSnapshot) -> Result<Snapshot> {
        validate_name(&req.name)?;
        let vm = self.get_vm(vm_id)?;
        require_stopped(&vm, "taking a snapshot")?;

        let snap_id = new_snapshot_id();
        self.backends.image.snapshot_create(&vm.disk_path, &snap_id)?;
        let meta = SnapshotMeta {
            name: req.name,
            created_at: now_utc(),
            description: req.description,
        };
        let stored = meta.clone();
        self.store.mutate(|t| {
            t.vm_mut(vm_id)?.snapshots.insert(snap_id.clone(), stored);
            Ok(())
        })?;

        let vm_size = self
            .backends
            .image
            .snapshot_list(&vm.disk_path)
            .ok()
            .and_then(|list| list.into_iter().find(|e| e.tag == snap_id))
            .map(|e| e.vm_size)
            .unwrap_or_else(|| "0 B".into());
        tracing::info!(vm_id, snapshot = %snap_id, "snapshot created");
        Ok(Snapshot {
            id: snap_id,
            name: meta.name,
            created_at: meta.created_at,
            description: meta.description,
            vm_size,
        })
    }

    /// Snapshots present in the image, joined with stored metadata by tag.
    pub fn list_snapshots(&self, vm_id: &str) -> Result<Vec<Snapshot>> {
        let vm = self.get_vm(vm_id)?;
        let entries = self.backends.image.snapshot_list(&vm.disk_path)?;
        Ok(entries
            .into_iter()
            .map(|e| match vm.snapshots.get(&e.tag) {
                Some(meta) => Snapshot {
                    id: e.tag,
                    name: meta.name.clone(),
                    created_at: meta.created_at.clone(),
                    description: meta.description.clone(),
                    vm_size: e.vm_size,
                },
                None => Snapshot {
                    name: e.tag.clone(),
                    id: e.tag,
                    created_at: e.date,
                    description: None,
                    vm_size: e.vm_size,
                },
            })
            .collect())
    }

    fn snapshot_in_image(&self, vm: &VmRecord, snap_id: &str) -> Result<bool> {
        validate_tag(snap_id)?;
        Ok(self
            .backends
            .image
            .snapshot_list(&vm.disk_path)?
            .iter()
            .any(|e| e.tag == snap_id))
    }

    pub fn restore_snapshot(&self, vm_id: &str, snap_id: &str) -> Result<VmRecord> {
        let vm = self.get_vm(vm_id)?;
        require_stopped(&vm, "restoring a snapshot")?;
        if !self.snapshot_in_image(&vm, snap_id)? {
            return Err(Error::snapshot_not_found(snap_id));
        }
        self.backends.image.snapshot_apply(&vm.disk_path, snap_id)?;
        tracing::info!(vm_id, snapshot = %snap_id, "snapshot restored");
        Ok(vm)
    }

    pub fn delete_snapshot(&self, vm_id: &str, snap_id: &str) -> Result<()> {
        let vm = self.get_vm(vm_id)?;
        require_stopped(&vm, "deleting a snapshot")?;
        let in_image = self.snapshot_in_image(&vm, snap_id)?;
        if !in_image && !vm.snapshots.contains_key(snap_id) {
            return Err(Error::snapshot_not_found(snap_id));
        }
        if in_image {
            self.backends.image.snapshot_delete(&vm.disk_path, snap_id)?;
        }
        self.store.mutate(|t| {
            t.vm_mut(vm_id)?.snapshots.remove(snap_id);
            Ok(())
        })?;
        tracing::info!(vm_id, snapshot = %snap_id, "snapshot deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Backups
    // ------------------------------------------------------------------

    /// Archive a stopped VM. Overlay disks are flattened first so the
    /// archive does not depend on another VM's image.
    pub fn backup_vm(&self, id: &str) -> Result<BackupInfo> {
        let vm = self.get_vm(id)?;
        require_stopped(&vm, "backing it up")?;
        let dir = &self.settings.backups_dir;
        fs::create_dir_all(dir).map_err(|e| Error::io_at(dir, e))?;

        let vm_dir = self.settings.vm_dir(id);
        let backup_name = backup::archive_name(&vm.name, chrono::Utc::now());
        let dest = dir.join(&backup_name);
        let flat = match self.backends.image.backing_file(&vm.disk_path)? {
            Some(_) => {
                let tmp = vm_dir.join("backup-flat.qcow2");
                self.backends.image.convert(&vm.disk_path, &tmp)?;
                Some(tmp)
            }
            None => None,
        };
        let vars = vm_dir.join(EFI_VARS_FILE);
        let record = serde_json::to_vec_pretty(&vm)?;
        let written = backup::write_archive(
            &dest,
            &record,
            flat.as_deref().unwrap_or(vm.disk_path.as_path()),
            vars.is_file().then_some(vars.as_path()),
        );
        if let Some(tmp) = &flat {
            let _ = fs::remove_file(tmp);
        }
        let size = written?;
        tracing::info!(vm_id = %id, backup = %backup_name, size, "backup created");
        Ok(BackupInfo {
            backup_name,
            path: dest,
            size,
            created_at: now_utc(),
        })
    }

    pub fn list_backups(&self) -> Result<Vec<BackupInfo>> {
        backup::list_backups(&self.settings.backups_dir)
    }

    /// New VM from an archive: fresh id, ports and MACs, no volumes. A
    /// failure leaves nothing behind.
    pub fn restore_backup(&self, archive: &Path, new_name: Option<&str>) -> Result<VmRecord> {
        if let Some(name) = new_name {
            validate_name(name)?;
        }
        let id = new_id();
        let vm_dir = self.settings.vm_dir(&id);
        let result = self.restore_into(archive, &id, &vm_dir, new_name);
        match &result {
            Ok(vm) => tracing::info!(vm_id = %vm.id, archive = %archive.display(), "vm restored"),
            Err(e) => {
                tracing::error!(archive = %archive.display(), error = %e, "restore failed");
                let _ = fs::remove_dir_all(&vm_dir);
            }
        }
        result
    }

    fn restore_into(
        &self,
        archive: &Path,
        id: &str,
        vm_dir: &Path,
        new_name: Option<&str>,
    ) -> Result<VmRecord> {
        backup::extract_archive(archive, vm_dir)?;
        let record_path = vm_dir.join(RECORD_MEMBER);
        let bytes = fs::read(&record_path).map_err(|e| Error::io_at(&record_path, e))?;
        let mut vm: VmRecord = serde_json::from_slice(&bytes)?;
        let _ = fs::remove_file(&record_path);

        if let Some(name) = new_name {
            vm.name = name.to_string();
        }
        validate_name(&vm.name)?;
        validate_memory(vm.memory)?;
        validate_cpus(vm.cpus)?;

        vm.id = id.to_string();
        vm.disk_path = vm_dir.join(DISK_FILE);
        vm.status = VmStatus::Stopped;
        vm.pid = None;
        vm.clear_proxies();
        vm.volumes.clear();
        vm.iso_path = vm.iso_path.filter(|p| p.is_file());
        vm.secondary_iso_path = vm.secondary_iso_path.filter(|p| p.is_file());
        vm.created_at = now_utc();
        regenerate_macs(&mut vm.networks)?;

        self.store.mutate(|t| {
            let (vnc_port, spice_port) = allocate_console_ports(t)?;
            vm.vnc_port = vnc_port;
            vm.spice_port = spice_port;
            t.vms.insert(vm.id.clone(), vm.clone());
            Ok(vm)
        })
    }

    // ------------------------------------------------------------------
    // Consoles
    // ------------------------------------------------------------------

    fn running_vm(&self, id: &str) -> Result<VmRecord> {
        let vm = self.get_vm(id)?;
        require_running(&vm)?;
        Ok(vm)
    }

    /// Start or reuse the VM's websockify bridge. The whole check, port
    /// choice and spawn happen inside one registry mutation, so concurrent
    /// callers (in this process or another) never race for a port or
    /// start a second bridge.
    pub fn vnc_connection(&self, id: &str) -> Result<VncConnection> {
        self.refresh()?;
        let vnc = &self.proxies.vnc;
        let (vnc_port, proxy) = self.store.mutate(|t| {
            let vm = t.vm(id)?;
            require_running(vm)?;
            let vnc_port = vm.vnc_port;
            let recorded = recorded_proxy(vm);
            let mut used: HashSet<u16> = t
                .vms
                .values()
                .filter(|v| v.id != id)
                .filter_map(|v| v.ws_port)
                .collect();
            used.extend(vnc.active_ports());
            let proxy = vnc.ensure(id, vnc_port, recorded, || {
                allocate_port(PortCategory::Proxy, &used)
            })?;
            let vm = t.vm_mut(id)?;
            vm.ws_port = Some(proxy.ws_port);
            vm.ws_proxy_pid = Some(proxy.pid);
            Ok((vnc_port, proxy))
        })?;
        Ok(VncConnection {
            vm_id: id.to_string(),
            vnc_port,
            ws_port: proxy.ws_port,
            pid: proxy.pid,
        })
    }

    pub fn disconnect_vnc(&self, id: &str) -> Result<()> {
        let vnc = &self.proxies.vnc;
        self.store.mutate(|t| {
            let vm = t.vm_mut(id)?;
            vnc.stop(id)?;
            vm.ws_port = None;
            vm.ws_proxy_pid = None;
            Ok(())
        })
    }

    pub fn spice_connection(&self, id: &str) -> Result<SpiceConnection> {
        let vm = self.running_vm(id)?;
        Ok(SpiceConnection {
            vm_id: vm.id.clone(),
            host: "127.0.0.1".into(),
            spice_port: vm.spice_port,
            ws_path: format!("{}{}", crate::console::server::SPICE_PATH, vm.id),
        })
    }

    /// Close every SPICE bridge of the VM. Nothing is persisted for them.
    pub fn disconnect_spice(&self, id: &str) -> Result<()> {
        self.store.read(|t| t.vm(id).map(|_| ()))?;
        let n = self.proxies.spice.cancel_vm(id);
        tracing::debug!(vm_id = %id, sessions = n, "spice consoles disconnected");
        Ok(())
    }

    /// CPU, memory and disk I/O of the VM's QEMU process.
    pub fn vm_metrics(&self, id: &str) -> Result<VmMetrics> {
        let vm = self.running_vm(id)?;
        let gone = || Error::InvalidState(format!("vm {} has no live process", vm.name));
        let pid = vm.pid.ok_or_else(gone)?;
        self.metrics.sample(id, pid, vm.memory).ok_or_else(gone)
    }

    // ------------------------------------------------------------------
    // Guest agent
    // ------------------------------------------------------------------

    fn guest_agent(&self, id: &str) -> Result<(GuestAgent, OsType)> {
        let vm = self.running_vm(id)?;
        let agent = GuestAgent::for_vm_dir(&self.settings.vm_dir(id))?;
        Ok((agent, vm.os_type))
    }

    pub fn guest_info(&self, id: &str) -> Result<GuestInfo> {
        let (agent, os) = self.guest_agent(id)?;
        collect_guest_info(&agent, os)
    }

    pub fn guest_exec(&self, id: &str, command: &str, timeout: Duration) -> Result<ExecOutput> {
        let (agent, os) = self.guest_agent(id)?;
        agent.exec(command, timeout, GuestShell::for_os(os))
    }

    pub fn resize_display(&self, id: &str, width: u32, height: u32) -> Result<String> {
        let (agent, _) = self.guest_agent(id)?;
        agent.resize_display(width, height)
    }

    // ------------------------------------------------------------------
    // Host
    // ------------------------------------------------------------------

    pub fn available_isos(&self) -> Result<Vec<IsoFile>> {
        let dir = &self.settings.iso_dir;
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::io_at(dir, e)),
        };
        let mut isos: Vec<IsoFile> = entries
            .flatten()
            .filter(|e| {
                e.path()
                    .extension()
                    .is_some_and(|x| x.eq_ignore_ascii_case("iso"))
            })
            .filter_map(|e| {
                let meta = e.metadata().ok().filter(|m| m.is_file())?;
                Some(IsoFile {
                    name: e.file_name().to_string_lossy().into_owned(),
                    path: e.path(),
                    size: meta.len(),
                })
            })
            .collect();
        isos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(isos)
    }

    pub fn available_bridges(&self) -> Vec<String> {
        network::available_bridges(&network::sys_class_net())
    }

    pub fn available_interfaces(&self) -> Vec<String> {
        network::available_interfaces(&network::sys_class_net())
    }

    /// Seed ISO in the ISO directory, named after the hostname.
    pub fn create_cloudinit_iso(&self, cfg: &CloudInitConfig) -> Result<PathBuf> {
        cfg.validate()?;
        let tool = cloudinit::find_iso_tool()?;
        let dest = self
            .settings
            .iso_dir
            .join(format!("cloudinit-{}.iso", cfg.hostname));
        cloudinit::build_seed_iso(&tool, cfg, &dest)?;
        Ok(dest)
    }

    pub fn host_health(&self) -> HostHealth {
        let qemu = match run_tool(
            std::process::Command::new(&self.settings.qemu_bin).arg("--version"),
        ) {
            Ok(out) => HealthCheck {
                ok: true,
                detail: String::from_utf8_lossy(&out.stdout)
                    .lines()
                    .next()
                    .map(str::to_string),
            },
            Err(e) => HealthCheck {
                ok: false,
                detail: Some(e.to_string()),
            },
        };
        let kvm = HealthCheck {
            ok: Path::new("/dev/kvm").exists(),
            detail: None,
        };
        let disk = match free_space(&self.settings.vms_dir) {
            Ok(bytes) => {
                let free_gb = bytes as f64 / (1024.0 * 1024.0 * 1024.0);
                HealthCheck {
                    ok: free_gb > MIN_FREE_GB,
                    detail: Some(format!("{free_gb:.1} GB free")),
                }
            }
            Err(e) => HealthCheck {
                ok: false,
                detail: Some(e.to_string()),
            },
        };
        HostHealth {
            healthy: qemu.ok && kvm.ok && disk.ok,
            qemu,
            kvm,
            disk,
        }
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Service start: settle every status, forget console bridges that
    /// are gone and drop macvtap links of VMs that are not running.
    pub fn startup_reconcile(&self) -> Result<usize> {
        let vnc = &self.proxies.vnc;
        let changed = self.store.mutate(|t| {
            let mut changed = 0;
            for vm in t.vms.values_mut() {
                let (mut status, pid) = observed(vm);
                if pid.is_none() && matches!(status, VmStatus::Starting | VmStatus::Stopping) {
                    status = VmStatus::Stopped;
                }
                if (status, pid) != (vm.status, vm.pid) {
                    tracing::info!(vm_id = %vm.id, from = %vm.status, to = %status, "reconciled vm status");
                    changed += 1;
                }
                vm.status = status;
                vm.pid = pid;
                let bridge_alive = status == VmStatus::Running
                    && vnc.status(&vm.id, recorded_proxy(vm)).is_some();
                if !bridge_alive {
                    vm.clear_proxies();
                }
            }
            Ok(changed)
        })?;
        self.sweep_console_orphans();
        self.sweep_macvtap_orphans();
        Ok(changed)
    }

    /// Kill websocket bridges that no running VM's record claims. Runs
    /// under the registry's shared lock, so a bridge another process is
    /// starting right now is never taken for an orphan.
    pub fn sweep_console_orphans(&self) -> usize {
        self.store.read(|t| {
            let claimed: HashMap<String, u32> = t
                .vms
                .values()
                .filter(|vm| vm.status == VmStatus::Running)
                .filter_map(|vm| Some((vm.id.clone(), vm.ws_proxy_pid?)))
                .collect();
            self.proxies.sweep_orphans(&claimed)
        })
    }

    /// Remove macvtap links not owned by a running or starting VM.
    pub fn sweep_macvtap_orphans(&self) -> usize {
        let active: HashSet<String> = self.store.read(|t| {
            t.vms
                .values()
                .filter(|vm| matches!(vm.status, VmStatus::Running | VmStatus::Starting))
                .map(|vm| macvtap_prefix(&vm.id))
                .collect()
        });
        network::sweep_orphans(&active, self.backends.net_helper.as_ref())
    }

    /// One pass of the periodic sweep.
    pub fn periodic_sweep(&self) {
        if let Err(e) = self.refresh() {
            tracing::warn!(error = %e, "status refresh failed");
        }
        self.sweep_console_orphans();
        self.sweep_macvtap_orphans();
    }

    /// Stop every console. VMs keep running.
    pub fn shutdown(&self) {
        self.proxies.shutdown();
    }
}

impl SpiceTargets for VmManager {
    fn spice_port(&self, vm_id: &str) -> Result<u16> {
        let vm = self.running_vm(vm_id)?;
        if vm.spice_port == 0 {
            return Err(Error::InvalidState(format!(
                "vm {} has no spice port",
                vm.name
            )));
        }
        Ok(vm.spice_port)
    }
}
