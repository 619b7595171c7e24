//! Process supervision for QEMU, swtpm and websocket bridges.
//!
//! Children are started in their own session so they outlive the caller,
//! with stdout/stderr appended to a log file. A reaper thread waits on every
//! child we spawn so exited processes never linger as zombies.

use crate::error::{Error, Result};
use crate::utils::system::tail_file;
use std::fs::{self, OpenOptions};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

/// How long a child must survive before it counts as started.
pub const STARTUP_CHECK: Duration = Duration::from_millis(500);

/// How long to wait for a child to write its own pidfile.
pub const PIDFILE_WAIT: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const SIGKILL_WAIT: Duration = Duration::from_secs(2);
const LOG_EXCERPT_BYTES: u64 = 2048;

/// First descriptor number handed to the child; passed fds land at 3, 4, ...
pub const FIRST_CHILD_FD: RawFd = 3;
/// Passed fds are staged above this number before the fork.
const FD_STAGE_BASE: RawFd = 100;

/// Everything needed to launch one supervised process.
#[derive(Debug)]
pub struct ProcessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// stdout and stderr are appended here.
    pub log_path: PathBuf,
    pub pidfile: PathBuf,
    /// The program writes `pidfile` itself (QEMU `-pidfile`, swtpm `--pid`).
    pub child_writes_pidfile: bool,
    /// Descriptors inherited by the child as 3, 4, ... in order.
    pub fds: Vec<OwnedFd>,
}

impl ProcessSpec {
    pub fn new(program: impl Into<PathBuf>, log_path: PathBuf, pidfile: PathBuf) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            log_path,
            pidfile,
            child_writes_pidfile: false,
            fds: Vec::new(),
        }
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn command_line(&self) -> String {
        let mut s = self.program.display().to_string();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

/// True when `pid` names a live process that is not a zombie.
pub fn is_running(pid: u32) -> bool {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    let alive = unsafe { libc::kill(raw, 0) } == 0
        || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM);
    alive && !is_zombie(pid)
}

fn is_zombie(pid: u32) -> bool {
    // /proc/<pid>/stat: "pid (comm) S ..."; comm may contain spaces or parens.
    let Ok(stat) = fs::read_to_string(format!("/proc/{pid}/stat")) else {
        return false;
    };
    stat.rfind(')')
        .and_then(|i| stat[i + 1..].trim_start().chars().next())
        .is_some_and(|state| state == 'Z' || state == 'X')
}

/// Parse a pidfile. Missing or malformed files give `None`.
pub fn read_pidfile(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Poll until `path` holds a pid or `timeout` elapses.
pub fn wait_for_pidfile(path: &Path, timeout: Duration) -> Option<u32> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(pid) = read_pidfile(path) {
            return Some(pid);
        }
        if Instant::now() >= deadline {
            return None;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

/// Launch a detached child and return its pid once it has survived the
/// startup check.
pub fn start(spec: ProcessSpec) -> Result<u32> {
    let command_line = spec.command_line();
    if let Some(parent) = spec.log_path.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }
    let log = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&spec.log_path)
        .map_err(|e| Error::io_at(&spec.log_path, e))?;
    let log_err = log.try_clone()?;
    let _ = fs::remove_file(&spec.pidfile);

    let staged = stage_fds(&spec.fds)?;
    let raw: Vec<RawFd> = staged.iter().map(AsRawFd::as_raw_fd).collect();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::from(log))
        .stderr(Stdio::from(log_err));
    if let Some(cwd) = &spec.cwd {
        cmd.current_dir(cwd);
    }
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(io::Error::last_os_error());
            }
            for (i, fd) in raw.iter().enumerate() {
                // dup2 leaves FD_CLOEXEC clear on the target.
                if libc::dup2(*fd, FIRST_CHILD_FD + i as RawFd) == -1 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    tracing::info!(command = %command_line, log = %spec.log_path.display(), "starting process");
    let mut child = cmd.spawn().map_err(|e| Error::ProcessStartFailed {
        command: command_line.clone(),
        log_excerpt: e.to_string(),
    })?;
    drop(staged);
    drop(spec.fds);

    std::thread::sleep(STARTUP_CHECK);
    if let Some(status) = child.try_wait()? {
        let mut excerpt = tail_file(&spec.log_path, LOG_EXCERPT_BYTES).trim().to_string();
        if excerpt.is_empty() {
            excerpt = format!("exited immediately with {status}");
        }
        tracing::error!(command = %command_line, %status, "process exited during startup");
        return Err(Error::ProcessStartFailed {
            command: command_line,
            log_excerpt: excerpt,
        });
    }

    let child_pid = child.id();
    std::thread::spawn(move || {
        let _ = child.wait();
    });

    let pid = if spec.child_writes_pidfile {
        match wait_for_pidfile(&spec.pidfile, PIDFILE_WAIT) {
            Some(pid) => pid,
            None => {
                let _ = stop(child_pid, Duration::from_secs(1));
                return Err(Error::ProcessStartFailed {
                    command: command_line,
                    log_excerpt: format!(
                        "pidfile {} not written within {:?}",
                        spec.pidfile.display(),
                        PIDFILE_WAIT
                    ),
                });
            }
        }
    } else {
        fs::write(&spec.pidfile, format!("{child_pid}\n"))
            .map_err(|e| Error::io_at(&spec.pidfile, e))?;
        child_pid
    };
    tracing::info!(pid, command = %command_line, "process started");
    Ok(pid)
}

/// Duplicate the fds to be passed above [`FD_STAGE_BASE`] so the dup2 calls
/// in the child can never overwrite a source that has not been moved yet.
fn stage_fds(fds: &[OwnedFd]) -> Result<Vec<OwnedFd>> {
    fds.iter()
        .map(|fd| {
            let staged = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, FD_STAGE_BASE) };
            if staged == -1 {
                return Err(Error::Io(io::Error::last_os_error()));
            }
            Ok(unsafe { OwnedFd::from_raw_fd(staged) })
        })
        .collect()
}

/// SIGTERM, wait up to `grace`, then SIGKILL. An absent process counts as
/// already stopped.
pub fn stop(pid: u32, grace: Duration) -> Result<()> {
    if !is_running(pid) {
        return Ok(());
    }
    let raw = libc::pid_t::try_from(pid)
        .map_err(|_| Error::Validation(format!("pid out of range: {pid}")))?;

    signal(raw, libc::SIGTERM)?;
    if wait_for_exit(pid, grace) {
        tracing::debug!(pid, "process stopped after SIGTERM");
        return Ok(());
    }

    tracing::warn!(pid, ?grace, "process ignored SIGTERM, sending SIGKILL");
    signal(raw, libc::SIGKILL)?;
    if !wait_for_exit(pid, SIGKILL_WAIT) {
        tracing::error!(pid, "process still alive after SIGKILL");
    }
    Ok(())
}

fn signal(pid: libc::pid_t, sig: libc::c_int) -> Result<()> {
    if unsafe { libc::kill(pid, sig) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        return Ok(());
    }
    Err(Error::Io(err))
}

fn wait_for_exit(pid: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while is_running(pid) {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    true
}

/// Stop whatever pid `pidfile` names and remove the file.
pub fn stop_pidfile(pidfile: &Path, grace: Duration) -> Result<()> {
    if let Some(pid) = read_pidfile(pidfile) {
        stop(pid, grace)?;
    }
    let _ = fs::remove_file(pidfile);
    Ok(())
}

/// Launches the hypervisor for a VM. The registry goes through this so it
/// can run without QEMU installed.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: ProcessSpec) -> Result<u32>;
}

/// Launches `spec` as-is through [`start`].
#[derive(Debug, Default)]
pub struct Supervisor;

impl Launcher for Supervisor {
    fn launch(&self, spec: ProcessSpec) -> Result<u32> {
        start(spec)
    }
}
