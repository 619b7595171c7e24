//! Backup archives: a gzip-compressed tar holding `vm.json`, the disk
//! image and, for UEFI guests, the variable store.

use crate::error::{Error, Result};
use crate::utils::paths::{is_contained, sanitize_file_stem};
use crate::vm::{DISK_FILE, EFI_VARS_FILE};
use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

pub const RECORD_MEMBER: &str = "vm.json";
pub const ARCHIVE_SUFFIX: &str = ".tar.gz";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BackupInfo {
    pub backup_name: String,
    pub path: PathBuf,
    pub size: u64,
    pub created_at: String,
}

/// `<sanitized name>_<YYYYmmdd_HHMMSS>.tar.gz`
pub fn archive_name(vm_name: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}_{}{ARCHIVE_SUFFIX}",
        sanitize_file_stem(vm_name),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Write the archive to `dest` through a temporary file. Returns its size.
pub fn write_archive(
    dest: &Path,
    record: &[u8],
    disk: &Path,
    efi_vars: Option<&Path>,
) -> Result<u64> {
    let partial = dest.with_extension("partial");
    let result = write_members(&partial, record, disk, efi_vars)
        .and_then(|()| fs::rename(&partial, dest).map_err(|e| Error::io_at(dest, e)));
    if result.is_err() {
        let _ = fs::remove_file(&partial);
    }
    result?;
    Ok(fs::metadata(dest).map_err(|e| Error::io_at(dest, e))?.len())
}

fn write_members(path: &Path, record: &[u8], disk: &Path, efi_vars: Option<&Path>) -> Result<()> {
    let file = File::create(path).map_err(|e| Error::io_at(path, e))?;
    let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));

    let mut header = tar::Header::new_gnu();
    header.set_size(record.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Utc::now().timestamp().max(0) as u64);
    header.set_cksum();
    tar.append_data(&mut header, RECORD_MEMBER, record)?;

    tar.append_path_with_name(disk, DISK_FILE)
        .map_err(|e| Error::io_at(disk, e))?;
    if let Some(vars) = efi_vars {
        tar.append_path_with_name(vars, EFI_VARS_FILE)
            .map_err(|e| Error::io_at(vars, e))?;
    }
    tar.into_inner()?.finish()?.sync_all()?;
    Ok(())
}

/// Reject absolute member paths and any `..` segment.
pub fn check_member(path: &Path) -> Result<()> {
    if !is_contained(path) {
        return Err(Error::Validation(format!(
            "unsafe archive member path: {}",
            path.display()
        )));
    }
    Ok(())
}

fn open(archive: &Path) -> Result<tar::Archive<GzDecoder<File>>> {
    let file = File::open(archive).map_err(|e| Error::io_at(archive, e))?;
    Ok(tar::Archive::new(GzDecoder::new(file)))
}

/// Check every member before anything touches the filesystem: paths must be
/// relative without `..`, entries plain files or directories, and the
/// record and disk must both be present.
pub fn validate_archive(archive: &Path) -> Result<()> {
    let mut tar = open(archive)?;
    let (mut has_record, mut has_disk) = (false, false);
    for entry in tar.entries()? {
        let entry = entry?;
        let path = entry.path()?.into_owned();
        check_member(&path)?;
        let kind = entry.header().entry_type();
        if !(kind.is_file() || kind.is_dir()) {
            return Err(Error::Validation(format!(
                "archive member {} is not a regular file",
                path.display()
            )));
        }
        has_record |= path == Path::new(RECORD_MEMBER);
        has_disk |= path == Path::new(DISK_FILE);
    }
    if !has_record || !has_disk {
        return Err(Error::Validation(format!(
            "backup archive must contain {RECORD_MEMBER} and {DISK_FILE}"
        )));
    }
    Ok(())
}

/// Validate, then unpack into `dest`. The caller owns cleanup of `dest`.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<()> {
    validate_archive(archive)?;
    fs::create_dir_all(dest).map_err(|e| Error::io_at(dest, e))?;
    let mut tar = open(archive)?;
    for entry in tar.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.into_owned();
        check_member(&path)?;
        if !entry.unpack_in(dest)? {
            return Err(Error::Validation(format!(
                "archive member {} escapes the destination",
                path.display()
            )));
        }
    }
    Ok(())
}

/// Archives in `dir`, newest first. A missing directory has none.
pub fn list_backups(dir: &Path) -> Result<Vec<BackupInfo>> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(Error::io_at(dir, e)),
    };
    let mut out = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if !name.ends_with(ARCHIVE_SUFFIX) {
            continue;
        }
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let created_at = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).to_rfc3339())
            .unwrap_or_default();
        out.push(BackupInfo {
            backup_name: name,
            path: entry.path(),
            size: meta.len(),
            created_at,
        });
    }
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::io::Write;
    use tempfile::TempDir;

    /// Archive whose second member has a raw, unvalidated name.
    fn hostile_archive(path: &Path, bad_name: &str) {
        let file = File::create(path).unwrap();
        let mut tar = tar::Builder::new(GzEncoder::new(file, Compression::default()));

        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        tar.append_data(&mut header, RECORD_MEMBER, &b"{}"[..]).unwrap();

        let mut header = tar::Header::new_old();
        let name = header.as_old_mut();
        name.name[..bad_name.len()].copy_from_slice(bad_name.as_bytes());
        header.set_size(4);
        header.set_mode(0o644);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        tar.append(&header, &b"root"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_archive_name() {
        let at = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap();
        assert_eq!(archive_name("web 01", at), "web_01_20240309_140500.tar.gz");
    }

    #[test]
    fn test_write_then_extract() {
        let tmp = TempDir::new().unwrap();
        let disk = tmp.path().join("src.qcow2");
        fs::write(&disk, b"QFI\xfbdisk").unwrap();
        let vars = tmp.path().join("vars.fd");
        fs::write(&vars, b"vars").unwrap();

        let dest = tmp.path().join("b.tar.gz");
        let size = write_archive(&dest, br#"{"name":"a"}"#, &disk, Some(&vars)).unwrap();
        assert!(size > 0);
        assert!(!tmp.path().join("b.tar.partial").exists());

        let out = tmp.path().join("restored");
        extract_archive(&dest, &out).unwrap();
        assert_eq!(fs::read(out.join(DISK_FILE)).unwrap(), b"QFI\xfbdisk");
        assert_eq!(fs::read(out.join(EFI_VARS_FILE)).unwrap(), b"vars");
        assert_eq!(fs::read(out.join(RECORD_MEMBER)).unwrap(), br#"{"name":"a"}"#);
    }

    #[test]
    fn test_traversal_rejected_before_extraction() {
        let tmp = TempDir::new().unwrap();
        for bad in ["../../etc/passwd", "/etc/passwd"] {
            let archive = tmp.path().join("evil.tar.gz");
            hostile_archive(&archive, bad);
            let out = tmp.path().join("out");
            let err = extract_archive(&archive, &out).unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "{bad}: {err}");
            assert!(!out.exists(), "{bad}: nothing may be extracted");
        }
    }

    #[test]
    fn test_missing_disk_rejected() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("x.tar.gz");
        let mut tar = tar::Builder::new(GzEncoder::new(
            File::create(&archive).unwrap(),
            Compression::default(),
        ));
        let mut header = tar::Header::new_gnu();
        header.set_size(2);
        header.set_cksum();
        tar.append_data(&mut header, RECORD_MEMBER, &b"{}"[..]).unwrap();
        tar.into_inner().unwrap().finish().unwrap().flush().unwrap();

        assert!(validate_archive(&archive)
            .unwrap_err()
            .to_string()
            .contains(DISK_FILE));
    }

    #[test]
    fn test_list_backups() {
        let tmp = TempDir::new().unwrap();
        assert!(list_backups(&tmp.path().join("none")).unwrap().is_empty());
        fs::write(tmp.path().join("a_20240101_000000.tar.gz"), b"x").unwrap();
        fs::write(tmp.path().join("notes.txt"), b"x").unwrap();
        let all = list_backups(tmp.path()).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].backup_name, "a_20240101_000000.tar.gz");
        assert_eq!(all[0].size, 1);
    }
}
