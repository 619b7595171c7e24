//! QEMU command line assembly. Pure: every host lookup is resolved into a
//! [`HostEnv`] before the builder runs.

use crate::config::schema::{DisplayType, OsType, VmRecord, Volume};
use crate::config::settings::Settings;
use crate::error::{Error, Result};
use crate::vm::firmware::FirmwarePair;
use crate::vm::{EFI_VARS_FILE, QEMU_PIDFILE};
use std::path::{Path, PathBuf};

/// Host facts the command line depends on.
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    /// `/dev/kvm` is usable.
    pub kvm: bool,
    /// Firmware for UEFI guests; required when the VM asks for UEFI.
    pub firmware: Option<FirmwarePair>,
    /// Guest tools media, mounted for Windows guests when present.
    pub guest_tools_iso: Option<PathBuf>,
    /// Control socket of a running swtpm for this VM.
    pub tpm_socket: Option<PathBuf>,
}

impl HostEnv {
    /// Inspect the host for everything except the TPM socket.
    pub fn detect(settings: &Settings, vm: &VmRecord) -> Self {
        let firmware = if vm.uefi {
            match crate::vm::firmware::locate_firmware(&settings.qemu_bin) {
                Ok(pair) => Some(pair),
                Err(e) => {
                    tracing::warn!(vm_id = %vm.id, error = %e, "no UEFI firmware found");
                    None
                }
            }
        } else {
            None
        };
        Self {
            kvm: Path::new("/dev/kvm").exists(),
            firmware,
            guest_tools_iso: Some(settings.guest_tools_iso.clone()).filter(|p| p.is_file()),
            tpm_socket: None,
        }
    }
}

/// QEMU's option parser treats `,` as a separator; a literal comma is `,,`.
fn escape(value: &str) -> String {
    value.replace(',', ",,")
}

fn path_arg(p: &Path) -> String {
    escape(&p.to_string_lossy())
}

/// Full argv (without the program) for `vm`. `net_args` comes from the
/// network provisioner and is appended last.
pub fn build_args(
    vm: &VmRecord,
    volumes: &[Volume],
    vm_dir: &Path,
    host: &HostEnv,
    net_args: &[String],
) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();
    let mut push = |a: &str, b: String| {
        args.push(a.to_string());
        args.push(b);
    };

    push("-name", escape(&vm.name));

    let secure_boot = vm.uefi && host.firmware.as_ref().is_some_and(|f| f.secure_boot);
    let accel = if host.kvm { "kvm" } else { "tcg" };
    let machine = if secure_boot {
        format!("q35,smm=on,accel={accel}")
    } else {
        format!("q35,accel={accel}")
    };
    push("-machine", machine);

    // `host` passthrough needs KVM; TCG emulates the richest model instead.
    let cpu = if !host.kvm && vm.cpu_model == "host" {
        "max".to_string()
    } else {
        vm.cpu_model.clone()
    };
    push("-cpu", escape(&cpu));
    push("-m", vm.memory.to_string());
    push("-smp", vm.cpus.to_string());

    if vm.uefi {
        let fw = host.firmware.as_ref().ok_or_else(|| {
            Error::Configuration(
                "UEFI requested but no OVMF firmware found; install the ovmf package".into(),
            )
        })?;
        if secure_boot {
            push(
                "-global",
                "driver=cfi.pflash01,property=secure,value=on".into(),
            );
        }
        push(
            "-drive",
            format!(
                "if=pflash,format=raw,unit=0,readonly=on,file={}",
                path_arg(&fw.code)
            ),
        );
        push(
            "-drive",
            format!(
                "if=pflash,format=raw,unit=1,file={}",
                path_arg(&vm_dir.join(EFI_VARS_FILE))
            ),
        );
    }

    let disk_if = match vm.os_type {
        OsType::Windows => "ide",
        _ => "virtio",
    };
    push(
        "-drive",
        format!(
            "file={},format=qcow2,if={disk_if}",
            path_arg(&vm.disk_path)
        ),
    );
    for vol in volumes {
        push(
            "-drive",
            format!(
                "file={},format={},if={disk_if}",
                path_arg(&vol.path),
                vol.format.as_str()
            ),
        );
    }

    let mut cdroms: Vec<&Path> = [&vm.iso_path, &vm.secondary_iso_path]
        .into_iter()
        .flatten()
        .map(PathBuf::as_path)
        .collect();
    if vm.os_type == OsType::Windows {
        if let Some(tools) = &host.guest_tools_iso {
            if !cdroms.contains(&tools.as_path()) {
                cdroms.push(tools.as_path());
            }
        }
    }
    for iso in cdroms {
        push(
            "-drive",
            format!("file={},media=cdrom,readonly=on", path_arg(iso)),
        );
    }

    let order: String = vm.boot_order.iter().map(|d| d.letter()).collect();
    if !order.is_empty() {
        push("-boot", format!("order={order},menu=on"));
    }

    if vm.tpm {
        if let Some(sock) = &host.tpm_socket {
            push("-chardev", format!("socket,id=chrtpm,path={}", path_arg(sock)));
            push("-tpmdev", "emulator,id=tpm0,chardev=chrtpm".into());
            push("-device", "tpm-tis,tpmdev=tpm0".into());
        }
    }

    match vm.display {
        DisplayType::Std => push("-vga", "std".into()),
        DisplayType::Qxl => push("-vga", "qxl".into()),
        DisplayType::Virtio => {
            push("-vga", "none".into());
            push("-device", "virtio-vga".into());
        }
    }

    push("-vnc", format!("127.0.0.1:{}", vm.vnc_port.saturating_sub(5900)));
    push(
        "-spice",
        format!("port={},addr=127.0.0.1,disable-ticketing=on", vm.spice_port),
    );
    push("-device", "virtio-serial-pci".into());
    push("-chardev", "spicevmc,id=vdagent,name=vdagent".into());
    push(
        "-device",
        "virtserialport,chardev=vdagent,name=com.redhat.spice.0".into(),
    );
    push(
        "-chardev",
        format!(
            "socket,id=qga0,path={},server=on,wait=off",
            path_arg(&Settings::qga_socket(vm_dir))
        ),
    );
    push(
        "-device",
        "virtserialport,chardev=qga0,name=org.qemu.guest_agent.0".into(),
    );

    push("-device", "qemu-xhci".into());
    push("-device", "usb-tablet".into());
    if vm.os_type == OsType::Windows {
        push("-rtc", "base=localtime".into());
    }
    push("-pidfile", path_arg(&vm_dir.join(QEMU_PIDFILE)));
    push("-display", "none".into());

    args.extend(net_args.iter().cloned());
    Ok(args)
}
