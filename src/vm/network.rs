//! Network provisioning: QEMU `-netdev`/`-device` arguments per interface,
//! plus live macvtap creation for direct attachment to a host NIC.

use crate::config::schema::{NetworkConfig, NetworkMode, PortForward, Protocol};
use crate::error::{Error, Result};
use crate::utils::system::run_tool;
use crate::vm::allocator::{macvtap_name, macvtap_prefix};
use crate::vm::process::FIRST_CHILD_FD;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashSet;
use std::fs::{self, OpenOptions};
use std::os::fd::OwnedFd;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;

/// Linux interface names: at most 15 bytes, no separators or whitespace.
static IFACE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,14}$").expect("valid regex"));

static MAC_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[0-9a-fA-F]{2}(:[0-9a-fA-F]{2}){5}$").expect("valid regex"));

const SYS_CLASS_NET: &str = "/sys/class/net";

pub fn validate_iface_name(name: &str) -> Result<()> {
    if !IFACE_RE.is_match(name) {
        return Err(Error::Validation(format!("invalid interface name: {name:?}")));
    }
    Ok(())
}

pub fn validate_mac(mac: &str) -> Result<()> {
    if !MAC_RE.is_match(mac) {
        return Err(Error::Validation(format!("invalid mac address: {mac:?}")));
    }
    Ok(())
}

/// Host operations that need elevated privilege. Implementations validate
/// every name and MAC before it reaches a command line.
pub trait PrivilegedHelper: Send + Sync {
    /// Remove a link; a missing link is not an error.
    fn delete_link(&self, name: &str) -> Result<()>;
    /// Create a bridge-mode macvtap on `parent` with `mac` and bring it up.
    fn create_macvtap(&self, parent: &str, name: &str, mac: &str) -> Result<()>;
    /// Make `/dev/tap<ifindex>` accessible and open it read-write.
    fn open_tap(&self, name: &str) -> Result<OwnedFd>;
    /// Names of every link on the host.
    fn list_links(&self) -> Result<Vec<String>>;
}

/// [`PrivilegedHelper`] backed by `sudo -n ip` and `sudo -n chmod`.
#[derive(Debug, Clone)]
pub struct IpCommandHelper {
    sys_class_net: PathBuf,
}

impl Default for IpCommandHelper {
    fn default() -> Self {
        Self {
            sys_class_net: PathBuf::from(SYS_CLASS_NET),
        }
    }
}

impl IpCommandHelper {
    fn sudo(args: &[&str]) -> Result<()> {
        run_tool(Command::new("sudo").arg("-n").args(args))?;
        Ok(())
    }

    fn ifindex(&self, name: &str) -> Result<u32> {
        let path = self.sys_class_net.join(name).join("ifindex");
        let raw = fs::read_to_string(&path).map_err(|e| Error::io_at(&path, e))?;
        raw.trim()
            .parse()
            .map_err(|_| Error::Validation(format!("bad ifindex for {name}: {raw:?}")))
    }
}

impl PrivilegedHelper for IpCommandHelper {
    fn delete_link(&self, name: &str) -> Result<()> {
        validate_iface_name(name)?;
        if !self.sys_class_net.join(name).exists() {
            return Ok(());
        }
        Self::sudo(&["ip", "link", "delete", name])
    }

    fn create_macvtap(&self, parent: &str, name: &str, mac: &str) -> Result<()> {
        validate_iface_name(parent)?;
        validate_iface_name(name)?;
        validate_mac(mac)?;
        Self::sudo(&[
            "ip", "link", "add", "link", parent, "name", name, "type", "macvtap", "mode", "bridge",
        ])?;
        Self::sudo(&["ip", "link", "set", name, "address", mac])?;
        Self::sudo(&["ip", "link", "set", name, "up"])
    }

    fn open_tap(&self, name: &str) -> Result<OwnedFd> {
        validate_iface_name(name)?;
        let dev = format!("/dev/tap{}", self.ifindex(name)?);
        Self::sudo(&["chmod", "666", &dev])?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&dev)
            .map_err(|e| Error::io_at(&dev, e))?;
        Ok(OwnedFd::from(file))
    }

    fn list_links(&self) -> Result<Vec<String>> {
        list_dir_names(&self.sys_class_net)
    }
}

/// Host files that decide whether bridge mode can work.
#[derive(Debug, Clone)]
pub struct BridgeSetup {
    pub conf: PathBuf,
    pub helper: PathBuf,
}

/// Fail fast with remediation when `qemu-bridge-helper` would refuse `bridge`.
pub fn check_bridge(bridge: &str, setup: &BridgeSetup) -> Result<()> {
    validate_iface_name(bridge)?;
    let conf = fs::read_to_string(&setup.conf).map_err(|_| {
        Error::Configuration(format!(
            "{} is missing; run: echo 'allow {bridge}' | sudo tee -a {}",
            setup.conf.display(),
            setup.conf.display()
        ))
    })?;
    let allowed = conf.lines().any(|line| {
        let mut words = line.split_whitespace();
        words.next() == Some("allow") && matches!(words.next(), Some(b) if b == bridge || b == "all")
    });
    if !allowed {
        return Err(Error::Configuration(format!(
            "bridge {bridge} is not allowed in {}; run: echo 'allow {bridge}' | sudo tee -a {}",
            setup.conf.display(),
            setup.conf.display()
        )));
    }

    let meta = fs::metadata(&setup.helper).map_err(|_| {
        Error::Configuration(format!(
            "{} not found; install the qemu-system package",
            setup.helper.display()
        ))
    })?;
    if meta.permissions().mode() & 0o4000 == 0 {
        return Err(Error::Configuration(format!(
            "{} lacks the setuid bit; run: sudo chmod u+s {}",
            setup.helper.display(),
            setup.helper.display()
        )));
    }
    Ok(())
}

fn hostfwd(fwd: &PortForward) -> String {
    let proto = match fwd.protocol {
        Protocol::Tcp => "tcp",
        Protocol::Udp => "udp",
    };
    format!("hostfwd={proto}::{}-:{}", fwd.host_port, fwd.guest_port)
}

/// Arguments and inherited descriptors for one VM's interfaces.
#[derive(Debug, Default)]
pub struct NetworkPlan {
    pub args: Vec<String>,
    /// Passed to QEMU in order, starting at fd 3.
    pub fds: Vec<OwnedFd>,
    /// macvtap links created for this launch.
    pub created_links: Vec<String>,
}

/// Build the plan for `networks`, creating macvtap links as needed. Links
/// created before a failure are removed again.
pub fn prepare(
    vm_id: &str,
    networks: &[NetworkConfig],
    helper: &dyn PrivilegedHelper,
    bridge: &BridgeSetup,
) -> Result<NetworkPlan> {
    let mut plan = NetworkPlan::default();
    match build_into(&mut plan, vm_id, networks, helper, bridge) {
        Ok(()) => Ok(plan),
        Err(e) => {
            for link in &plan.created_links {
                if let Err(err) = helper.delete_link(link) {
                    tracing::warn!(link = %link, error = %err, "failed to remove macvtap after error");
                }
            }
            Err(e)
        }
    }
}

fn build_into(
    plan: &mut NetworkPlan,
    vm_id: &str,
    networks: &[NetworkConfig],
    helper: &dyn PrivilegedHelper,
    bridge: &BridgeSetup,
) -> Result<()> {
    for (idx, net) in networks.iter().enumerate() {
        let mac = net
            .mac
            .as_deref()
            .ok_or_else(|| Error::Validation(format!("network {idx} has no mac address")))?;
        validate_mac(mac)?;
        let id = format!("net{idx}");

        let netdev = match &net.mode {
            NetworkMode::Nat { port_forwards } => {
                let mut s = format!("user,id={id}");
                for fwd in port_forwards {
                    s.push(',');
                    s.push_str(&hostfwd(fwd));
                }
                s
            }
            NetworkMode::Isolated => format!("user,id={id},restrict=on"),
            NetworkMode::Bridge { bridge: br } => {
                check_bridge(br, bridge)?;
                format!("bridge,id={id},br={br},helper={}", bridge.helper.display())
            }
            NetworkMode::Macvtap { parent } => {
                validate_iface_name(parent)?;
                let name = macvtap_name(vm_id, idx);
                helper.delete_link(&name)?;
                helper.create_macvtap(parent, &name, mac)?;
                plan.created_links.push(name.clone());
                let fd = helper.open_tap(&name)?;
                let child_fd = FIRST_CHILD_FD as usize + plan.fds.len();
                plan.fds.push(fd);
                tracing::info!(vm_id, link = %name, parent = %parent, "created macvtap");
                format!("tap,id={id},fd={child_fd}")
            }
        };

        plan.args.push("-netdev".into());
        plan.args.push(netdev);
        plan.args.push("-device".into());
        plan.args.push(format!("{},netdev={id},mac={mac}", net.model.device()));
    }
    Ok(())
}

/// Remove every macvtap link belonging to `vm_id`.
pub fn teardown(vm_id: &str, helper: &dyn PrivilegedHelper) -> Result<usize> {
    let prefix = macvtap_prefix(vm_id);
    let mut removed = 0;
    for link in helper.list_links()? {
        if link.starts_with(&prefix) {
            helper.delete_link(&link)?;
            removed += 1;
        }
    }
    if removed > 0 {
        tracing::info!(vm_id, removed, "removed macvtap links");
    }
    Ok(removed)
}

/// Remove `mvt*` links whose prefix is not in `active_prefixes`.
pub fn sweep_orphans(active_prefixes: &HashSet<String>, helper: &dyn PrivilegedHelper) -> usize {
    let links = match helper.list_links() {
        Ok(links) => links,
        Err(e) => {
            tracing::warn!(error = %e, "cannot list links for macvtap sweep");
            return 0;
        }
    };
    let mut removed = 0;
    for link in links.iter().filter(|l| l.starts_with("mvt")) {
        if active_prefixes.iter().any(|p| link.starts_with(p.as_str())) {
            continue;
        }
        match helper.delete_link(link) {
            Ok(()) => {
                tracing::info!(link = %link, "removed orphan macvtap");
                removed += 1;
            }
            Err(e) => tracing::warn!(link = %link, error = %e, "failed to remove orphan macvtap"),
        }
    }
    removed
}

fn list_dir_names(dir: &Path) -> Result<Vec<String>> {
    let mut names: Vec<String> = fs::read_dir(dir)
        .map_err(|e| Error::io_at(dir, e))?
        .flatten()
        .filter_map(|e| e.file_name().into_string().ok())
        .collect();
    names.sort();
    Ok(names)
}

/// Host bridges (links with a `bridge/` directory).
pub fn available_bridges(sys_class_net: &Path) -> Vec<String> {
    list_dir_names(sys_class_net)
        .unwrap_or_default()
        .into_iter()
        .filter(|n| sys_class_net.join(n).join("bridge").is_dir())
        .collect()
}

/// Physical NICs usable as a macvtap parent (links backed by a device).
pub fn available_interfaces(sys_class_net: &Path) -> Vec<String> {
    list_dir_names(sys_class_net)
        .unwrap_or_default()
        .into_iter()
        .filter(|n| n != "lo" && sys_class_net.join(n).join("device").exists())
        .collect()
}

pub fn sys_class_net() -> PathBuf {
    PathBuf::from(SYS_CLASS_NET)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::NicModel;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    /// Records calls; hands out /dev/null as the tap device.
    #[derive(Default)]
    struct FakeHelper {
        links: Mutex<Vec<String>>,
        fail_open: bool,
    }

    impl PrivilegedHelper for FakeHelper {
        fn delete_link(&self, name: &str) -> Result<()> {
            self.links.lock().retain(|l| l != name);
            Ok(())
        }
        fn create_macvtap(&self, parent: &str, name: &str, mac: &str) -> Result<()> {
            validate_iface_name(parent)?;
            validate_mac(mac)?;
            self.links.lock().push(name.to_string());
            Ok(())
        }
        fn open_tap(&self, _name: &str) -> Result<OwnedFd> {
            if self.fail_open {
                return Err(Error::Configuration("no tap".into()));
            }
            Ok(OwnedFd::from(fs::File::open("/dev/null")?))
        }
        fn list_links(&self) -> Result<Vec<String>> {
            Ok(self.links.lock().clone())
        }
    }

    fn no_bridge() -> BridgeSetup {
        BridgeSetup {
            conf: PathBuf::from("/nonexistent/bridge.conf"),
            helper: PathBuf::from("/nonexistent/helper"),
        }
    }

    fn net(mode: NetworkMode, mac: &str) -> NetworkConfig {
        NetworkConfig {
            id: String::new(),
            mode,
            model: NicModel::VirtioNet,
            mac: Some(mac.into()),
        }
    }

    #[test]
    fn test_validation_allow_lists() {
        assert!(validate_iface_name("eth0").is_ok());
        assert!(validate_iface_name("enp3s0.100").is_ok());
        assert!(validate_iface_name("eth0; rm -rf /").is_err());
        assert!(validate_iface_name("averyveryverylongname").is_err());
        assert!(validate_iface_name("").is_err());
        assert!(validate_mac("52:54:00:AB:cd:01").is_ok());
        assert!(validate_mac("52:54:00:ab:cd").is_err());
        assert!(validate_mac("52:54:00:ab:cd:0g").is_err());
    }

    #[test]
    fn test_nat_and_isolated_args() {
        let helper = FakeHelper::default();
        let nets = vec![
            net(
                NetworkMode::Nat {
                    port_forwards: vec![PortForward {
                        protocol: Protocol::Tcp,
                        host_port: 2222,
                        guest_port: 22,
                    }],
                },
                "52:54:00:00:00:01",
            ),
            net(NetworkMode::Isolated, "52:54:00:00:00:02"),
        ];
        let plan = prepare("vm1", &nets, &helper, &no_bridge()).unwrap();
        assert_eq!(
            plan.args,
            vec![
                "-netdev",
                "user,id=net0,hostfwd=tcp::2222-:22",
                "-device",
                "virtio-net-pci,netdev=net0,mac=52:54:00:00:00:01",
                "-netdev",
                "user,id=net1,restrict=on",
                "-device",
                "virtio-net-pci,netdev=net1,mac=52:54:00:00:00:02",
            ]
        );
        assert!(plan.fds.is_empty());
    }

    #[test]
    fn test_macvtap_passes_fd() {
        let helper = FakeHelper::default();
        let id = "abcdef12-3456";
        let nets = vec![
            net(NetworkMode::default(), "52:54:00:00:00:01"),
            net(NetworkMode::Macvtap { parent: "eth0".into() }, "52:54:00:00:00:02"),
        ];
        let plan = prepare(id, &nets, &helper, &no_bridge()).unwrap();
        assert_eq!(plan.fds.len(), 1);
        assert_eq!(plan.created_links, vec!["mvtabcdef121"]);
        assert!(plan.args.contains(&"tap,id=net1,fd=3".to_string()));

        assert_eq!(teardown(id, &helper).unwrap(), 1);
        assert!(helper.list_links().unwrap().is_empty());
    }

    #[test]
    fn test_failed_macvtap_is_rolled_back() {
        let helper = FakeHelper {
            fail_open: true,
            ..Default::default()
        };
        let nets = vec![net(NetworkMode::Macvtap { parent: "eth0".into() }, "52:54:00:00:00:02")];
        assert!(prepare("vm1", &nets, &helper, &no_bridge()).is_err());
        assert!(helper.list_links().unwrap().is_empty());
    }

    #[test]
    fn test_bad_parent_rejected_before_helper() {
        let helper = FakeHelper::default();
        let nets = vec![net(
            NetworkMode::Macvtap {
                parent: "eth0 type dummy".into(),
            },
            "52:54:00:00:00:02",
        )];
        let err = prepare("vm1", &nets, &helper, &no_bridge()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(helper.list_links().unwrap().is_empty());
    }

    #[test]
    fn test_bridge_requires_conf_and_setuid() {
        let tmp = TempDir::new().unwrap();
        let conf = tmp.path().join("bridge.conf");
        let helper_bin = tmp.path().join("qemu-bridge-helper");
        let setup = BridgeSetup {
            conf: conf.clone(),
            helper: helper_bin.clone(),
        };

        let err = check_bridge("br0", &setup).unwrap_err();
        assert!(err.to_string().contains("allow br0"));

        fs::write(&conf, "allow virbr0\n").unwrap();
        assert!(check_bridge("br0", &setup).is_err());

        fs::write(&conf, "allow br0\n").unwrap();
        fs::write(&helper_bin, "").unwrap();
        fs::set_permissions(&helper_bin, fs::Permissions::from_mode(0o755)).unwrap();
        let err = check_bridge("br0", &setup).unwrap_err();
        assert!(err.to_string().contains("chmod u+s"));

        fs::set_permissions(&helper_bin, fs::Permissions::from_mode(0o4755)).unwrap();
        check_bridge("br0", &setup).unwrap();

        let nets = vec![net(NetworkMode::Bridge { bridge: "br0".into() }, "52:54:00:00:00:03")];
        let plan = prepare("vm1", &nets, &FakeHelper::default(), &setup).unwrap();
        assert_eq!(
            plan.args[1],
            format!("bridge,id=net0,br=br0,helper={}", helper_bin.display())
        );
    }

    #[test]
    fn test_sweep_keeps_active_links() {
        let helper = FakeHelper::default();
        helper.links.lock().extend(
            ["eth0", "mvtaaaaaaaa0", "mvtbbbbbbbb0", "mvtbbbbbbbb1"]
                .iter()
                .map(|s| s.to_string()),
        );
        let active: HashSet<String> = [macvtap_prefix("bbbbbbbb-1")].into_iter().collect();
        assert_eq!(sweep_orphans(&active, &helper), 1);
        assert_eq!(
            helper.list_links().unwrap(),
            vec!["eth0", "mvtbbbbbbbb0", "mvtbbbbbbbb1"]
        );
    }

    #[test]
    fn test_host_inventory() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path();
        fs::create_dir_all(root.join("br0/bridge")).unwrap();
        fs::create_dir_all(root.join("eth0/device")).unwrap();
        fs::create_dir_all(root.join("lo")).unwrap();
        assert_eq!(available_bridges(root), vec!["br0"]);
        assert_eq!(available_interfaces(root), vec!["eth0"]);
    }
}
