//! Persisted data model: VM records, network configs, volumes, snapshots.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Lifecycle state of a VM record.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            VmStatus::Stopped => "stopped",
            VmStatus::Starting => "starting",
            VmStatus::Running => "running",
            VmStatus::Stopping => "stopping",
            VmStatus::Error => "error",
        })
    }
}

/// Guest OS family; drives guest agent shells and auto-mounted tool media.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    #[default]
    Linux,
    Windows,
    Other,
}

/// Emulated display adapter.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DisplayType {
    #[default]
    Std,
    Qxl,
    Virtio,
}

/// Boot device, in QEMU's `-boot order=` letters.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BootDevice {
    Disk,
    Cdrom,
    Network,
}

impl BootDevice {
    pub fn letter(self) -> char {
        match self {
            BootDevice::Disk => 'c',
            BootDevice::Cdrom => 'd',
            BootDevice::Network => 'n',
        }
    }
}

pub fn default_boot_order() -> Vec<BootDevice> {
    vec![BootDevice::Cdrom, BootDevice::Disk]
}

/// Emulated NIC model.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NicModel {
    #[default]
    #[serde(rename = "virtio-net-pci")]
    VirtioNet,
    #[serde(rename = "e1000")]
    E1000,
    #[serde(rename = "rtl8139")]
    Rtl8139,
}

impl NicModel {
    pub fn device(self) -> &'static str {
        match self {
            NicModel::VirtioNet => "virtio-net-pci",
            NicModel::E1000 => "e1000",
            NicModel::Rtl8139 => "rtl8139",
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

/// Host to guest port forward for NAT networking.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct PortForward {
    #[serde(default)]
    pub protocol: Protocol,
    pub host_port: u16,
    pub guest_port: u16,
}

/// Mode-specific network parameters.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum NetworkMode {
    Nat {
        #[serde(default)]
        port_forwards: Vec<PortForward>,
    },
    Bridge {
        bridge: String,
    },
    Macvtap {
        parent: String,
    },
    Isolated,
}

impl Default for NetworkMode {
    fn default() -> Self {
        NetworkMode::Nat {
            port_forwards: Vec::new(),
        }
    }
}

/// One network interface of a VM.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    #[serde(default)]
    pub id: String,
    #[serde(flatten)]
    pub mode: NetworkMode,
    #[serde(default)]
    pub model: NicModel,
    #[serde(default)]
    pub mac: Option<String>,
}

/// Human-facing metadata for an internal disk snapshot, keyed by image tag.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SnapshotMeta {
    pub name: String,
    pub created_at: String,
    #[serde(default)]
    pub description: Option<String>,
}

/// Snapshot as surfaced to callers: image state joined with metadata.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: String,
    pub name: String,
    pub created_at: String,
    pub description: Option<String>,
    pub vm_size: String,
}

/// Persisted VM record.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct VmRecord {
    pub id: String,
    pub name: String,
    pub memory: u32,
    pub cpus: u32,
    pub disk_size: u32,
    pub disk_path: PathBuf,
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
    #[serde(default)]
    pub secondary_iso_path: Option<PathBuf>,
    #[serde(default)]
    pub os_type: OsType,
    pub vnc_port: u16,
    pub spice_port: u16,
    #[serde(default)]
    pub ws_port: Option<u16>,
    #[serde(default)]
    pub ws_proxy_pid: Option<u32>,
    #[serde(default)]
    pub status: VmStatus,
    #[serde(default)]
    pub pid: Option<u32>,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default = "default_boot_order")]
    pub boot_order: Vec<BootDevice>,
    #[serde(default = "default_cpu_model")]
    pub cpu_model: String,
    #[serde(default)]
    pub display: DisplayType,
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub tpm: bool,
    #[serde(default)]
    pub snapshots: BTreeMap<String, SnapshotMeta>,
    pub created_at: String,
}

impl VmRecord {
    /// Drop transient console bookkeeping.
    pub fn clear_proxies(&mut self) {
        self.ws_port = None;
        self.ws_proxy_pid = None;
    }
}

pub fn default_cpu_model() -> String {
    "host".to_string()
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DiskFormat {
    #[default]
    Qcow2,
    Raw,
}

impl DiskFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            DiskFormat::Qcow2 => "qcow2",
            DiskFormat::Raw => "raw",
        }
    }
}

/// Standalone volume that can be attached to one VM at a time.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Volume {
    pub id: String,
    pub name: String,
    pub size: u32,
    pub format: DiskFormat,
    pub path: PathBuf,
    #[serde(default)]
    pub attached_to: Option<String>,
    pub created_at: String,
}

// ---------------------------------------------------------------------------
// Requests
// ---------------------------------------------------------------------------

/// Parameters for creating a VM.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateVm {
    pub name: String,
    pub memory: u32,
    pub cpus: u32,
    pub disk_size: u32,
    #[serde(default)]
    pub iso_path: Option<PathBuf>,
    #[serde(default)]
    pub secondary_iso_path: Option<PathBuf>,
    #[serde(default)]
    pub os_type: OsType,
    #[serde(default)]
    pub networks: Vec<NetworkConfig>,
    #[serde(default = "default_boot_order")]
    pub boot_order: Vec<BootDevice>,
    #[serde(default = "default_cpu_model")]
    pub cpu_model: String,
    #[serde(default)]
    pub display: DisplayType,
    #[serde(default)]
    pub uefi: bool,
    #[serde(default)]
    pub tpm: bool,
}

impl Default for CreateVm {
    fn default() -> Self {
        Self {
            name: String::new(),
            memory: 2048,
            cpus: 2,
            disk_size: 20,
            iso_path: None,
            secondary_iso_path: None,
            os_type: OsType::default(),
            networks: vec![NetworkConfig::default()],
            boot_order: default_boot_order(),
            cpu_model: default_cpu_model(),
            display: DisplayType::default(),
            uefi: false,
            tpm: false,
        }
    }
}

impl CreateVm {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_memory(self.memory)?;
        validate_cpus(self.cpus)?;
        if !(1..=2048).contains(&self.disk_size) {
            return Err(Error::Validation(format!(
                "disk size must be between 1 and 2048 GB, got {}",
                self.disk_size
            )));
        }
        Ok(())
    }
}

/// Partial update of a stopped VM. `None` leaves a field untouched; an empty
/// ISO path detaches the ISO.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct UpdateVm {
    pub name: Option<String>,
    pub memory: Option<u32>,
    pub cpus: Option<u32>,
    pub iso_path: Option<PathBuf>,
    pub secondary_iso_path: Option<PathBuf>,
    pub os_type: Option<OsType>,
    pub networks: Option<Vec<NetworkConfig>>,
    pub boot_order: Option<Vec<BootDevice>>,
    pub cpu_model: Option<String>,
    pub display: Option<DisplayType>,
    pub uefi: Option<bool>,
    pub tpm: Option<bool>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CloneVm {
    pub name: String,
    pub memory: Option<u32>,
    pub cpus: Option<u32>,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreateVolume {
    pub name: String,
    pub size: u32,
    #[serde(default)]
    pub format: DiskFormat,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct CreateSnapshot {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

pub fn validate_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if len == 0 || len > 50 {
        return Err(Error::Validation(format!(
            "name must be 1-50 characters, got {len}"
        )));
    }
    if name.chars().any(|c| c.is_control()) {
        return Err(Error::Validation("name contains control characters".into()));
    }
    Ok(())
}

pub fn validate_memory(memory: u32) -> Result<()> {
    if !(256..=262_144).contains(&memory) {
        return Err(Error::Validation(format!(
            "memory must be between 256 and 262144 MB, got {memory}"
        )));
    }
    Ok(())
}

pub fn validate_cpus(cpus: u32) -> Result<()> {
    if !(1..=64).contains(&cpus) {
        return Err(Error::Validation(format!(
            "cpus must be between 1 and 64, got {cpus}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_config_json_shape() {
        let cfg = NetworkConfig {
            id: "n0".into(),
            mode: NetworkMode::Nat {
                port_forwards: vec![PortForward {
                    protocol: Protocol::Tcp,
                    host_port: 2222,
                    guest_port: 22,
                }],
            },
            model: NicModel::VirtioNet,
            mac: Some("52:54:00:aa:bb:cc".into()),
        };
        let json = serde_json::to_value(&cfg).unwrap();
        assert_eq!(json["mode"], "nat");
        assert_eq!(json["model"], "virtio-net-pci");
        assert_eq!(json["port_forwards"][0]["host_port"], 2222);

        let parsed: NetworkConfig = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, cfg);
    }

    #[test]
    fn test_network_config_defaults() {
        let parsed: NetworkConfig =
            serde_json::from_str(r#"{"mode":"bridge","bridge":"br0"}"#).unwrap();
        assert_eq!(
            parsed.mode,
            NetworkMode::Bridge {
                bridge: "br0".into()
            }
        );
        assert_eq!(parsed.model, NicModel::VirtioNet);
        assert!(parsed.mac.is_none());
        assert!(parsed.id.is_empty());
    }

    #[test]
    fn test_vm_record_tolerates_missing_optional_fields() {
        let json = r#"{
            "id": "abc", "name": "t1", "memory": 1024, "cpus": 1,
            "disk_size": 10, "disk_path": "/tmp/abc/disk.qcow2",
            "vnc_port": 5900, "spice_port": 5800,
            "created_at": "2024-01-01T00:00:00Z"
        }"#;
        let vm: VmRecord = serde_json::from_str(json).unwrap();
        assert_eq!(vm.status, VmStatus::Stopped);
        assert_eq!(vm.boot_order, default_boot_order());
        assert_eq!(vm.cpu_model, "host");
        assert!(vm.snapshots.is_empty());
    }

    #[test]
    fn test_create_validation() {
        let ok = CreateVm {
            name: "t1".into(),
            memory: 1024,
            cpus: 1,
            disk_size: 10,
            ..Default::default()
        };
        assert!(ok.validate().is_ok());

        let bad = CreateVm {
            name: String::new(),
            ..ok.clone()
        };
        assert!(matches!(bad.validate(), Err(Error::Validation(_))));

        let bad = CreateVm { cpus: 0, ..ok };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_boot_letters() {
        let order: String = default_boot_order().iter().map(|d| d.letter()).collect();
        assert_eq!(order, "dc");
    }
}
