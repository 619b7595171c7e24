//! System utility functions

use crate::error::{Error, Result};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

/// Get current UTC timestamp in RFC3339 format
pub fn now_utc() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Pick qemu-system-* for the given guest architecture
pub fn pick_qemu_bin(arch: &str) -> Result<PathBuf> {
    let candidates: &[&str] = match arch {
        "aarch64" => &["qemu-system-aarch64"],
        "x86_64" => &["qemu-system-x86_64", "qemu-kvm"],
        other => {
            return Err(Error::Configuration(format!("unsupported arch '{other}'")));
        }
    };
    candidates
        .iter()
        .find_map(|c| which::which(c).ok())
        .ok_or_else(|| {
            Error::Configuration(format!(
                "qemu-system-{arch} not found in PATH; install the qemu-system package"
            ))
        })
}

/// First candidate found in `PATH`, else the bare name of the first one so the
/// eventual spawn error names the missing tool.
pub fn find_tool(candidates: &[&str]) -> PathBuf {
    candidates
        .iter()
        .find_map(|c| which::which(c).ok())
        .unwrap_or_else(|| PathBuf::from(candidates[0]))
}

/// Render a command line for error messages.
pub fn describe(cmd: &Command) -> String {
    let mut s = cmd.get_program().to_string_lossy().into_owned();
    for arg in cmd.get_args() {
        s.push(' ');
        s.push_str(&arg.to_string_lossy());
    }
    s
}

/// Run an external tool to completion, capturing stderr into the error.
pub fn run_tool(cmd: &mut Command) -> Result<Output> {
    let line = describe(cmd);
    tracing::debug!(command = %line, "running tool");
    let output = cmd.output().map_err(|e| Error::CommandFailed {
        command: line.clone(),
        stderr: e.to_string(),
    })?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        tracing::warn!(command = %line, status = ?output.status.code(), %stderr, "tool failed");
        return Err(Error::CommandFailed {
            command: line,
            stderr: if stderr.is_empty() {
                format!("exit status {}", output.status.code().unwrap_or(-1))
            } else {
                stderr
            },
        });
    }
    Ok(output)
}

/// Last `max_bytes` of a file, lossily decoded. Missing files give "".
pub fn tail_file(path: &Path, max_bytes: u64) -> String {
    let Ok(mut f) = File::open(path) else {
        return String::new();
    };
    let len = f.metadata().map(|m| m.len()).unwrap_or(0);
    if len > max_bytes {
        let _ = f.seek(SeekFrom::Start(len - max_bytes));
    }
    let mut buf = Vec::new();
    let _ = f.read_to_end(&mut buf);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Bytes available to unprivileged users on the filesystem holding `path`.
pub fn free_space(path: &Path) -> Result<u64> {
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::os::unix::ffi::OsStrExt;

    let c_path = CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Validation(format!("path contains a nul byte: {}", path.display())))?;
    let mut stat = MaybeUninit::<libc::statvfs>::uninit();
    if unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) } != 0 {
        return Err(Error::io_at(path, std::io::Error::last_os_error()));
    }
    let stat = unsafe { stat.assume_init() };
    Ok(stat.f_bavail as u64 * stat.f_frsize as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_now_utc() {
        let timestamp = now_utc();
        assert!(timestamp.contains('T'));
        assert!(timestamp.ends_with('Z') || timestamp.ends_with("+00:00"));
    }

    #[test]
    fn test_pick_qemu_bin_unsupported() {
        let result = pick_qemu_bin("unsupported");
        assert!(result.unwrap_err().to_string().contains("unsupported arch"));
    }

    #[test]
    fn test_run_tool_captures_stderr() {
        let err = run_tool(Command::new("sh").args(["-c", "echo boom >&2; exit 3"])).unwrap_err();
        match err {
            Error::CommandFailed { command, stderr } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_tail_file() {
        let tmp = TempDir::new().unwrap();
        let p = tmp.path().join("log");
        let mut f = File::create(&p).unwrap();
        write!(f, "0123456789").unwrap();
        assert_eq!(tail_file(&p, 4), "6789");
        assert_eq!(tail_file(&p, 100), "0123456789");
        assert_eq!(tail_file(&tmp.path().join("missing"), 4), "");
    }

    #[test]
    fn test_free_space() {
        let tmp = TempDir::new().unwrap();
        assert!(free_space(tmp.path()).unwrap() > 0);
        assert!(free_space(&tmp.path().join("missing")).is_err());
    }
}
