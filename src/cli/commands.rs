//! CLI command definitions

use crate::config::schema::{
    DiskFormat, DisplayType, NetworkConfig, NetworkMode, NicModel, OsType, PortForward, Protocol,
};
use clap::{Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::net::SocketAddr;
use std::path::PathBuf;

/// qvmd: QEMU VM orchestration and console access
#[derive(Parser, Debug)]
#[command(
    name = "qvmd",
    version,
    about = "QEMU VM orchestration and console access"
)]
pub struct Cli {
    /// State directory (default ~/qvmd)
    #[arg(long, global = true, env = "QVMD_HOME")]
    pub home: Option<PathBuf>,

    /// Debug logging (RUST_LOG wins when set)
    #[arg(long, short, global = true)]
    pub verbose: bool,

    /// Print JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub cmd: Cmd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum OsArg {
    Linux,
    Windows,
    Other,
}

impl From<OsArg> for OsType {
    fn from(v: OsArg) -> Self {
        match v {
            OsArg::Linux => OsType::Linux,
            OsArg::Windows => OsType::Windows,
            OsArg::Other => OsType::Other,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum DisplayArg {
    Std,
    Qxl,
    Virtio,
}

impl From<DisplayArg> for DisplayType {
    fn from(v: DisplayArg) -> Self {
        match v {
            DisplayArg::Std => DisplayType::Std,
            DisplayArg::Qxl => DisplayType::Qxl,
            DisplayArg::Virtio => DisplayType::Virtio,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug)]
pub enum FormatArg {
    Qcow2,
    Raw,
}

impl From<FormatArg> for DiskFormat {
    fn from(v: FormatArg) -> Self {
        match v {
            FormatArg::Qcow2 => DiskFormat::Qcow2,
            FormatArg::Raw => DiskFormat::Raw,
        }
    }
}

/// Parse `--net` values:
/// `nat[:HOST-GUEST[/udp],...]`, `bridge:BR`, `macvtap:IFACE`, `isolated`,
/// each optionally suffixed with `@e1000` or `@rtl8139`.
pub fn parse_network(s: &str) -> Result<NetworkConfig, String> {
    let (spec, model) = match s.split_once('@') {
        Some((spec, "virtio")) | Some((spec, "virtio-net-pci")) => (spec, NicModel::VirtioNet),
        Some((spec, "e1000")) => (spec, NicModel::E1000),
        Some((spec, "rtl8139")) => (spec, NicModel::Rtl8139),
        Some((_, other)) => return Err(format!("unknown nic model {other:?}")),
        None => (s, NicModel::VirtioNet),
    };
    let (kind, arg) = match spec.split_once(':') {
        Some((k, a)) => (k, Some(a)),
        None => (spec, None),
    };
    let mode = match (kind, arg) {
        ("nat", None) => NetworkMode::default(),
        ("nat", Some(fwds)) => NetworkMode::Nat {
            port_forwards: fwds
                .split(',')
                .map(parse_forward)
                .collect::<Result<_, _>>()?,
        },
        ("bridge", Some(br)) if !br.is_empty() => NetworkMode::Bridge { bridge: br.into() },
        ("macvtap", Some(p)) if !p.is_empty() => NetworkMode::Macvtap { parent: p.into() },
        ("isolated", None) => NetworkMode::Isolated,
        _ => return Err(format!("invalid network {s:?}")),
    };
    Ok(NetworkConfig {
        mode,
        model,
        ..NetworkConfig::default()
    })
}

fn parse_forward(s: &str) -> Result<PortForward, String> {
    let (ports, protocol) = match s.split_once('/') {
        Some((p, "tcp")) => (p, Protocol::Tcp),
        Some((p, "udp")) => (p, Protocol::Udp),
        Some((_, other)) => return Err(format!("unknown protocol {other:?}")),
        None => (s, Protocol::Tcp),
    };
    let (host, guest) = ports
        .split_once('-')
        .ok_or_else(|| format!("port forward must be HOST-GUEST, got {s:?}"))?;
    let port = |p: &str| p.parse::<u16>().map_err(|e| format!("bad port {p:?}: {e}"));
    Ok(PortForward {
        protocol,
        host_port: port(host)?,
        guest_port: port(guest)?,
    })
}

#[derive(Subcommand, Debug)]
pub enum Cmd {
    /// Create a VM and its primary disk
    Create {
        name: String,

        /// Memory (MB)
        #[arg(long, default_value_t = 2048)]
        memory: u32,

        #[arg(long, default_value_t = 2)]
        cpus: u32,

        /// Primary disk size (GB)
        #[arg(long, default_value_t = 20)]
        disk_size: u32,

        /// Install ISO; relative paths are looked up in the ISO directory
        #[arg(long)]
        iso: Option<PathBuf>,

        #[arg(long)]
        secondary_iso: Option<PathBuf>,

        #[arg(long, value_enum, default_value = "linux")]
        os: OsArg,

        /// Network interface; repeat for several (default: one NAT interface)
        #[arg(long = "net", value_parser = parse_network)]
        networks: Vec<NetworkConfig>,

        #[arg(long, default_value = "host")]
        cpu_model: String,

        #[arg(long, value_enum, default_value = "std")]
        display: DisplayArg,

        #[arg(long)]
        uefi: bool,

        /// Attach a software TPM (needs swtpm)
        #[arg(long)]
        tpm: bool,
    },

    /// List VMs
    List,

    /// Show one VM
    Info { vm: String },

    /// Start a VM
    Start { vm: String },

    /// Stop a VM (SIGTERM, then SIGKILL after the grace period)
    Stop { vm: String },

    /// Stop then start a VM
    Restart { vm: String },

    /// Delete a VM and its files
    Delete {
        vm: String,
        /// Skip confirmation prompt
        #[arg(long, short)]
        force: bool,
    },

    /// Copy-on-write clone of a stopped VM
    Clone {
        vm: String,
        name: String,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
    },

    /// Change settings of a stopped VM
    Update {
        vm: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        memory: Option<u32>,
        #[arg(long)]
        cpus: Option<u32>,
        /// Install ISO; pass "" to detach
        #[arg(long)]
        iso: Option<String>,
        #[arg(long, value_enum)]
        os: Option<OsArg>,
        /// Replace all interfaces
        #[arg(long = "net", value_parser = parse_network)]
        networks: Vec<NetworkConfig>,
    },

    /// Tail of the VM's QEMU log
    Logs { vm: String },

    /// CPU, memory and disk I/O of a running VM's QEMU process
    Metrics { vm: String },

    /// Disk snapshots of a stopped VM
    Snapshot {
        #[command(subcommand)]
        cmd: SnapshotCmd,
    },

    /// Standalone data volumes
    Volume {
        #[command(subcommand)]
        cmd: VolumeCmd,
    },

    /// Archive a stopped VM into the backup directory
    Backup { vm: String },

    /// List backup archives
    Backups,

    /// Create a new VM from a backup archive
    Restore {
        archive: PathBuf,
        /// Name of the restored VM (default: the archived name)
        #[arg(long)]
        name: Option<String>,
    },

    /// Start (or reuse) the noVNC websocket bridge of a running VM
    Vnc {
        vm: String,
        /// Stop the bridge instead
        #[arg(long)]
        disconnect: bool,
    },

    /// SPICE websocket details of a running VM
    Spice { vm: String },

    /// Guest information from the guest agent
    GuestInfo { vm: String },

    /// Run a command in the guest through the guest agent
    GuestExec {
        vm: String,
        /// Seconds to wait for the command
        #[arg(long, default_value_t = 30)]
        timeout: u64,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
        command: Vec<String>,
    },

    /// Resize the guest display through the guest agent
    ResizeDisplay { vm: String, width: u32, height: u32 },

    /// Build a cloud-init seed ISO in the ISO directory
    CloudInit {
        hostname: String,
        #[arg(long, default_value = "ubuntu")]
        username: String,
        /// Plain text or crypt(3) hash
        #[arg(long, env = "QVMD_CLOUDINIT_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        #[arg(long = "ssh-key")]
        ssh_keys: Vec<String>,
        #[arg(long = "package")]
        packages: Vec<String>,
    },

    /// Host inventory and health
    Host {
        #[command(subcommand)]
        cmd: HostCmd,
    },

    /// Run the SPICE websocket server and the maintenance sweeper
    Serve {
        #[arg(long, default_value = "127.0.0.1:6090")]
        listen: SocketAddr,
        /// Bearer token clients pass as ?token=
        #[arg(long, env = "QVMD_CONSOLE_TOKEN", hide_env_values = true)]
        token: String,
    },

    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Generate man page
    ManPage,
}

#[derive(Subcommand, Debug)]
pub enum SnapshotCmd {
    Create {
        vm: String,
        name: String,
        #[arg(long)]
        description: Option<String>,
    },
    List {
        vm: String,
    },
    Restore {
        vm: String,
        snapshot: String,
    },
    Delete {
        vm: String,
        snapshot: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum VolumeCmd {
    Create {
        name: String,
        /// Size (GB)
        #[arg(long)]
        size: u32,
        #[arg(long, value_enum, default_value = "qcow2")]
        format: FormatArg,
    },
    List,
    Attach {
        vm: String,
        volume: String,
    },
    Detach {
        vm: String,
        volume: String,
    },
    /// Replace the VM's primary disk with an attached volume
    Promote {
        vm: String,
        volume: String,
    },
    Delete {
        volume: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum HostCmd {
    /// Check qemu, /dev/kvm and free disk space
    Health,
    /// ISO images in the ISO directory
    Isos,
    /// Linux bridges usable in bridge mode
    Bridges,
    /// Physical interfaces usable as macvtap parents
    Interfaces,
}
