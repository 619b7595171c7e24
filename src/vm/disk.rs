//! Disk image operations through `qemu-img`.

use crate::config::schema::DiskFormat;
use crate::error::{Error, Result};
use crate::utils::system::run_tool;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Command;

static DATE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").expect("valid regex"));

/// One row of `qemu-img snapshot -l`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotEntry {
    pub id: String,
    pub tag: String,
    pub vm_size: String,
    pub date: String,
}

/// Image tool seam; [`QemuImg`] is the production implementation.
pub trait ImageTool: Send + Sync {
    fn create(&self, path: &Path, format: DiskFormat, size_gb: u32) -> Result<()>;
    /// qcow2 image at `path` that records only changes over `backing`.
    fn create_overlay(&self, backing: &Path, path: &Path) -> Result<()>;
    /// Standalone qcow2 copy of `src`, flattening any backing chain.
    fn convert(&self, src: &Path, dst: &Path) -> Result<()>;
    fn backing_file(&self, path: &Path) -> Result<Option<PathBuf>>;
    fn snapshot_create(&self, disk: &Path, tag: &str) -> Result<()>;
    fn snapshot_apply(&self, disk: &Path, tag: &str) -> Result<()>;
    fn snapshot_delete(&self, disk: &Path, tag: &str) -> Result<()>;
    fn snapshot_list(&self, disk: &Path) -> Result<Vec<SnapshotEntry>>;
}

#[derive(Debug, Clone)]
pub struct QemuImg {
    pub bin: PathBuf,
}

impl QemuImg {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }

    fn command(&self) -> Command {
        Command::new(&self.bin)
    }

    fn stdout(mut cmd: Command) -> Result<String> {
        let out = run_tool(&mut cmd)?;
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn snapshot(&self, flag: &str, disk: &Path, tag: &str) -> Result<()> {
        validate_tag(tag)?;
        let mut cmd = self.command();
        cmd.args(["snapshot", flag, tag]).arg(disk);
        Self::stdout(cmd)?;
        Ok(())
    }
}

impl ImageTool for QemuImg {
    fn create(&self, path: &Path, format: DiskFormat, size_gb: u32) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["create", "-f", format.as_str()])
            .arg(path)
            .arg(format!("{size_gb}G"));
        Self::stdout(cmd)?;
        tracing::info!(path = %path.display(), size_gb, format = format.as_str(), "created disk image");
        Ok(())
    }

    fn create_overlay(&self, backing: &Path, path: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["create", "-f", "qcow2", "-b"])
            .arg(backing)
            .args(["-F", "qcow2"])
            .arg(path);
        Self::stdout(cmd)?;
        Ok(())
    }

    fn convert(&self, src: &Path, dst: &Path) -> Result<()> {
        let mut cmd = self.command();
        cmd.args(["convert", "-O", "qcow2"]).arg(src).arg(dst);
        Self::stdout(cmd)?;
        Ok(())
    }

    fn backing_file(&self, path: &Path) -> Result<Option<PathBuf>> {
        let mut cmd = self.command();
        cmd.args(["info", "--output=json", "-U"]).arg(path);
        let info: serde_json::Value = serde_json::from_str(&Self::stdout(cmd)?)?;
        Ok(info
            .get("full-backing-filename")
            .or_else(|| info.get("backing-filename"))
            .and_then(|v| v.as_str())
            .map(PathBuf::from))
    }

    fn snapshot_create(&self, disk: &Path, tag: &str) -> Result<()> {
        self.snapshot("-c", disk, tag)
    }

    fn snapshot_apply(&self, disk: &Path, tag: &str) -> Result<()> {
        self.snapshot("-a", disk, tag)
    }

    fn snapshot_delete(&self, disk: &Path, tag: &str) -> Result<()> {
        self.snapshot("-d", disk, tag)
    }

    fn snapshot_list(&self, disk: &Path) -> Result<Vec<SnapshotEntry>> {
        let mut cmd = self.command();
        cmd.args(["snapshot", "-l"]).arg(disk);
        Ok(parse_snapshot_table(&Self::stdout(cmd)?))
    }
}

/// Parse `qemu-img snapshot -l` output. The VM SIZE column is one token on
/// old releases ("0") and two on newer ones ("0 B"), so the row is anchored
/// on the date column instead of on fixed positions.
pub fn parse_snapshot_table(output: &str) -> Vec<SnapshotEntry> {
    output
        .lines()
        .skip_while(|l| !l.trim_start().starts_with("ID"))
        .skip(1)
        .filter_map(|line| {
            let tokens: Vec<&str> = line.split_whitespace().collect();
            let date_idx = tokens.iter().position(|t| DATE_RE.is_match(t))?;
            if date_idx < 2 {
                return None;
            }
            Some(SnapshotEntry {
                id: tokens[0].to_string(),
                tag: tokens[1].to_string(),
                vm_size: tokens[2..date_idx].join(" "),
                date: tokens[date_idx..(date_idx + 2).min(tokens.len())].join(" "),
            })
        })
        .collect()
}

/// Reject tags that qemu-img would misread as options.
pub fn validate_tag(tag: &str) -> Result<()> {
    if tag.is_empty() || tag.starts_with('-') || tag.chars().any(char::is_whitespace) {
        return Err(Error::Validation(format!("invalid snapshot tag: {tag:?}")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    #[test]
    fn test_parse_new_format() {
        let out = "Snapshot list:\n\
ID        TAG               VM SIZE                DATE        VM CLOCK     ICOUNT\n\
1         3fa2b9c1              0 B 2024-05-01 10:11:12  0000:00:00.000          0\n\
2         77aa00ff          1.2 GiB 2024-05-02 08:00:00  0000:01:02.003          0\n";
        let rows = parse_snapshot_table(out);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].tag, "3fa2b9c1");
        assert_eq!(rows[0].vm_size, "0 B");
        assert_eq!(rows[1].vm_size, "1.2 GiB");
        assert_eq!(rows[1].date, "2024-05-02 08:00:00");
    }

    #[test]
    fn test_parse_old_format_and_empty() {
        let out = "Snapshot list:\n\
ID        TAG                 VM SIZE                DATE       VM CLOCK\n\
1         deadbeef                  0 2023-01-01 00:00:00   00:00:00.000\n";
        let rows = parse_snapshot_table(out);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "1");
        assert_eq!(rows[0].vm_size, "0");

        assert!(parse_snapshot_table("").is_empty());
    }

    #[test]
    fn test_validate_tag() {
        assert!(validate_tag("3fa2b9c1").is_ok());
        assert!(validate_tag("-d").is_err());
        assert!(validate_tag("a b").is_err());
        assert!(validate_tag("").is_err());
    }

    #[test]
    fn test_qemu_img_argv() {
        let tmp = TempDir::new().unwrap();
        let log = tmp.path().join("argv");
        let script = tmp.path().join("qemu-img");
        fs::write(
            &script,
            format!("#!/bin/sh\necho \"$@\" >> {}\n", log.display()),
        )
        .unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let tool = QemuImg::new(&script);
        tool.create(Path::new("/v/disk.qcow2"), DiskFormat::Qcow2, 10)
            .unwrap();
        tool.create_overlay(Path::new("/a/disk.qcow2"), Path::new("/b/disk.qcow2"))
            .unwrap();
        tool.snapshot_apply(Path::new("/v/disk.qcow2"), "abcd1234")
            .unwrap();

        let lines: Vec<String> = fs::read_to_string(&log)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect();
        assert_eq!(
            lines,
            vec![
                "create -f qcow2 /v/disk.qcow2 10G",
                "create -f qcow2 -b /a/disk.qcow2 -F qcow2 /b/disk.qcow2",
                "snapshot -a abcd1234 /v/disk.qcow2",
            ]
        );
    }

    #[test]
    fn test_qemu_img_failure_carries_stderr() {
        let tmp = TempDir::new().unwrap();
        let script = tmp.path().join("qemu-img");
        fs::write(&script, "#!/bin/sh\necho 'Could not open' >&2\nexit 1\n").unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();

        let err = QemuImg::new(&script)
            .snapshot_list(Path::new("/missing.qcow2"))
            .unwrap_err();
        assert!(err.to_string().contains("Could not open"));
    }
}
