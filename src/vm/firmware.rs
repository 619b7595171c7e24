//! UEFI firmware detection

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Matched firmware code image and the variable-store template it pairs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwarePair {
    pub code: PathBuf,
    pub vars_template: PathBuf,
    /// Code image built with Secure Boot; needs SMM and a secure pflash.
    pub secure_boot: bool,
}

/// (code, vars, secure boot) in order of preference. Secure Boot pairs ship
/// Microsoft keys in their vars template, so they go first.
const X86_64_PAIRS: &[(&str, &str, bool)] = &[
    ("OVMF_CODE_4M.secboot.fd", "OVMF_VARS_4M.ms.fd", true),
    ("OVMF_CODE.secboot.fd", "OVMF_VARS.ms.fd", true),
    ("OVMF_CODE.secboot.fd", "OVMF_VARS.secboot.fd", true),
    ("OVMF_CODE_4M.fd", "OVMF_VARS_4M.fd", false),
    ("OVMF_CODE.fd", "OVMF_VARS.fd", false),
    ("edk2-x86_64-secure-code.fd", "edk2-i386-vars.fd", true),
    ("edk2-x86_64-code.fd", "edk2-i386-vars.fd", false),
    ("edk2-x86_64-code.fd", "edk2-x86_64-vars.fd", false),
];

const AARCH64_PAIRS: &[(&str, &str, bool)] = &[
    ("edk2-aarch64-code.fd", "edk2-arm-vars.fd", false),
    ("AAVMF_CODE.fd", "AAVMF_VARS.fd", false),
];

/// Directories worth probing for a given qemu-system binary: distro paths,
/// the `share` tree next to the binary, and Nix store copies of qemu.
pub fn firmware_dirs(qemu_bin: &Path) -> Vec<PathBuf> {
    let mut dirs: Vec<PathBuf> = [
        "/usr/share/OVMF",
        "/usr/share/ovmf",
        "/usr/share/edk2/ovmf",
        "/usr/share/edk2/x64",
        "/usr/share/edk2-ovmf/x64",
        "/usr/share/AAVMF",
        "/usr/share/qemu",
        "/run/current-system/sw/share/qemu",
    ]
    .iter()
    .map(PathBuf::from)
    .collect();

    // .../bin/qemu-system-* -> .../share/qemu
    let bin_real = qemu_bin
        .canonicalize()
        .unwrap_or_else(|_| qemu_bin.to_path_buf());
    if let Some(prefix) = bin_real.parent().and_then(Path::parent) {
        dirs.push(prefix.join("share/qemu"));
    }

    if let Ok(iter) = fs::read_dir("/nix/store") {
        for e in iter.flatten() {
            let p = e.path();
            let Some(name) = p.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if name.contains("-qemu-") || name.contains("-OVMF-") {
                for sub in ["share/qemu", "FV"] {
                    let q = p.join(sub);
                    if q.is_dir() {
                        dirs.push(q);
                    }
                }
            }
        }
    }
    dirs
}

/// First firmware pair present in `dirs`, walking the precedence list
/// before the directory list so a Secure Boot pair anywhere wins.
pub fn locate_in(dirs: &[PathBuf], arch: &str) -> Result<FirmwarePair> {
    let pairs = match arch {
        "x86_64" => X86_64_PAIRS,
        "aarch64" => AARCH64_PAIRS,
        other => return Err(Error::Configuration(format!("unsupported arch '{other}'"))),
    };

    for (code, vars, secure_boot) in pairs {
        for d in dirs.iter().filter(|d| d.is_dir()) {
            let c = d.join(code);
            let v = d.join(vars);
            if c.is_file() && v.is_file() {
                tracing::debug!(code = %c.display(), secure_boot, "found UEFI firmware");
                return Ok(FirmwarePair {
                    code: c,
                    vars_template: v,
                    secure_boot: *secure_boot,
                });
            }
        }
    }
    Err(Error::Configuration(format!(
        "UEFI firmware not found for {arch}; install the ovmf (or edk2-ovmf) package"
    )))
}

/// Locate firmware for the host architecture next to `qemu_bin`.
pub fn locate_firmware(qemu_bin: &Path) -> Result<FirmwarePair> {
    locate_in(&firmware_dirs(qemu_bin), std::env::consts::ARCH)
}

/// Copy the vars template into the VM directory unless the VM already has
/// its own variable store.
pub fn ensure_vars(pair: &FirmwarePair, vm_vars: &Path) -> Result<()> {
    if vm_vars.exists() {
        return Ok(());
    }
    fs::copy(&pair.vars_template, vm_vars).map_err(|e| Error::io_at(vm_vars, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), b"fw").unwrap();
    }

    #[test]
    fn test_secure_boot_pair_preferred() {
        let plain = TempDir::new().unwrap();
        let secure = TempDir::new().unwrap();
        touch(plain.path(), "OVMF_CODE.fd");
        touch(plain.path(), "OVMF_VARS.fd");
        touch(secure.path(), "OVMF_CODE_4M.secboot.fd");
        touch(secure.path(), "OVMF_VARS_4M.ms.fd");

        let dirs = vec![plain.path().to_path_buf(), secure.path().to_path_buf()];
        let pair = locate_in(&dirs, "x86_64").unwrap();
        assert!(pair.secure_boot);
        assert_eq!(pair.code, secure.path().join("OVMF_CODE_4M.secboot.fd"));
    }

    #[test]
    fn test_fallback_pair() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "edk2-x86_64-code.fd");
        touch(dir.path(), "edk2-i386-vars.fd");
        // Code without its vars must not match.
        touch(dir.path(), "OVMF_CODE.fd");

        let pair = locate_in(&[dir.path().to_path_buf()], "x86_64").unwrap();
        assert!(!pair.secure_boot);
        assert_eq!(pair.vars_template, dir.path().join("edk2-i386-vars.fd"));
    }

    #[test]
    fn test_not_found_is_configuration_error() {
        let dir = TempDir::new().unwrap();
        let err = locate_in(&[dir.path().to_path_buf()], "x86_64").unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(locate_in(&[], "sparc").is_err());
    }

    #[test]
    fn test_ensure_vars_keeps_existing() {
        let dir = TempDir::new().unwrap();
        touch(dir.path(), "OVMF_CODE.fd");
        touch(dir.path(), "OVMF_VARS.fd");
        let pair = locate_in(&[dir.path().to_path_buf()], "x86_64").unwrap();

        let vars = dir.path().join("efi_vars.fd");
        ensure_vars(&pair, &vars).unwrap();
        assert_eq!(fs::read(&vars).unwrap(), b"fw");

        fs::write(&vars, b"modified").unwrap();
        ensure_vars(&pair, &vars).unwrap();
        assert_eq!(fs::read(&vars).unwrap(), b"modified");
    }
}
