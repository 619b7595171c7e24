//! QGA wire client over the VM's Unix socket.
//!
//! Each call opens a fresh connection, sends the `0xFF` sync byte, drains
//! whatever the agent still had buffered, then exchanges one
//! newline-terminated JSON command and reply.

use crate::config::schema::OsType;
use crate::error::{Error, Result};
use base64::Engine as _;
use serde_json::{json, Value};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
pub const POLL_INTERVAL: Duration = Duration::from_millis(300);
const SYNC_SETTLE: Duration = Duration::from_millis(100);
const SYNC_BYTE: u8 = 0xFF;

/// Interpreter used to run a command line inside the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuestShell {
    Sh,
    Cmd,
    PowerShell,
}

impl GuestShell {
    pub fn for_os(os: OsType) -> Self {
        match os {
            OsType::Windows => GuestShell::Cmd,
            _ => GuestShell::Sh,
        }
    }

    fn invocation(self, command: &str) -> (&'static str, Vec<String>) {
        match self {
            GuestShell::Sh => ("/bin/sh", vec!["-c".into(), command.into()]),
            GuestShell::Cmd => ("cmd.exe", vec!["/c".into(), command.into()]),
            GuestShell::PowerShell => (
                "powershell.exe",
                vec![
                    "-NoProfile".into(),
                    "-NonInteractive".into(),
                    "-Command".into(),
                    command.into(),
                ],
            ),
        }
    }
}

/// Result of a finished guest command.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

#[derive(Debug, Clone)]
pub struct GuestAgent {
    socket_path: PathBuf,
    timeout: Duration,
}

impl GuestAgent {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Agent for the VM in `vm_dir`; `AgentUnavailable` when QEMU never
    /// created the socket.
    pub fn for_vm_dir(vm_dir: &Path) -> Result<Self> {
        let socket = crate::config::settings::Settings::qga_socket(vm_dir);
        if !socket.exists() {
            return Err(Error::AgentUnavailable(format!(
                "socket not found: {}",
                socket.display()
            )));
        }
        Ok(Self::new(socket))
    }

    /// Per-call socket timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn send_recv(&self, command: &Value, deadline: Instant) -> Result<Value> {
        let unavailable = |e: std::io::Error| {
            Error::AgentUnavailable(format!("{}: {e}", self.socket_path.display()))
        };
        let remaining = || {
            deadline
                .saturating_duration_since(Instant::now())
                .max(Duration::from_millis(1))
        };

        let mut sock = UnixStream::connect(&self.socket_path).map_err(unavailable)?;
        sock.set_write_timeout(Some(remaining())).map_err(unavailable)?;
        sock.write_all(&[SYNC_BYTE]).map_err(unavailable)?;
        std::thread::sleep(SYNC_SETTLE.min(remaining()));

        sock.set_nonblocking(true).map_err(unavailable)?;
        let mut scratch = [0u8; 4096];
        loop {
            match sock.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        sock.set_nonblocking(false).map_err(unavailable)?;

        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');
        sock.set_write_timeout(Some(remaining())).map_err(unavailable)?;
        sock.write_all(&line).map_err(unavailable)?;

        let mut data = Vec::new();
        while !data.contains(&b'\n') {
            sock.set_read_timeout(Some(remaining())).map_err(unavailable)?;
            match sock.read(&mut scratch) {
                Ok(0) => break,
                Ok(n) => data.extend_from_slice(&scratch[..n]),
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(unavailable(e)),
            }
        }

        let end = data.iter().position(|b| *b == b'\n').unwrap_or(data.len());
        let body: Vec<u8> = data[..end]
            .iter()
            .copied()
            .skip_while(|b| *b == SYNC_BYTE || b.is_ascii_whitespace())
            .collect();
        if body.is_empty() {
            return Err(Error::AgentProtocol("empty response".into()));
        }
        serde_json::from_slice(&body)
            .map_err(|e| Error::AgentProtocol(format!("malformed response: {e}")))
    }

    fn call(&self, command: &Value) -> Result<Value> {
        self.send_recv(command, Instant::now() + self.timeout)
    }

    /// True iff the agent answers `guest-ping`. Never fails.
    pub fn ping(&self) -> bool {
        match self.call(&json!({"execute": "guest-ping"})) {
            Ok(resp) => resp.get("return").is_some(),
            Err(e) => {
                tracing::debug!(socket = %self.socket_path.display(), error = %e, "guest ping failed");
                false
            }
        }
    }

    /// Run an argument-less command and unwrap its `return` value.
    pub fn query(&self, command: &str) -> Result<Value> {
        let resp = self.call(&json!({"execute": command}))?;
        unwrap_return(command, resp)
    }

    /// Run `command` through `shell` and wait for it, polling every
    /// [`POLL_INTERVAL`] until it exits or `timeout` passes.
    pub fn exec(&self, command: &str, timeout: Duration, shell: GuestShell) -> Result<ExecOutput> {
        let deadline = Instant::now() + timeout;
        let (path, args) = shell.invocation(command);

        let started = self.send_recv(
            &json!({
                "execute": "guest-exec",
                "arguments": {"path": path, "arg": args, "capture-output": true}
            }),
            deadline.min(Instant::now() + self.timeout),
        );
        let started = match started {
            Err(_) if Instant::now() >= deadline => return Err(Error::AgentTimeout(timeout)),
            other => unwrap_return("guest-exec", other?)?,
        };
        let pid = started
            .get("pid")
            .and_then(Value::as_i64)
            .ok_or_else(|| Error::AgentProtocol("guest-exec returned no pid".into()))?;

        let status_cmd = json!({"execute": "guest-exec-status", "arguments": {"pid": pid}});
        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::warn!(pid, ?timeout, "guest command timed out");
                return Err(Error::AgentTimeout(timeout));
            }
            let status = match self.send_recv(&status_cmd, deadline.min(now + self.timeout)) {
                Err(_) if Instant::now() >= deadline => return Err(Error::AgentTimeout(timeout)),
                other => unwrap_return("guest-exec-status", other?)?,
            };

            if status.get("exited").and_then(Value::as_bool).unwrap_or(false) {
                let output = ExecOutput {
                    stdout: decode_stream(&status, "out-data")?,
                    stderr: decode_stream(&status, "err-data")?,
                    exit_code: status.get("exitcode").and_then(Value::as_i64).unwrap_or(-1),
                };
                if output.exit_code != 0 {
                    tracing::warn!(pid, exit_code = output.exit_code, stderr = %output.stderr, "guest command failed");
                }
                return Ok(output);
            }
            std::thread::sleep(POLL_INTERVAL.min(deadline.saturating_duration_since(Instant::now())));
        }
    }

    /// Resize the guest's X display with xrandr, adding a CVT mode when the
    /// size is not offered yet. Returns the mode reported afterwards.
    pub fn resize_display(&self, width: u32, height: u32) -> Result<String> {
        if !(640..=7680).contains(&width) || !(480..=4320).contains(&height) {
            return Err(Error::Validation(format!(
                "display size {width}x{height} outside 640x480..7680x4320"
            )));
        }
        if !self.ping() {
            return Err(Error::AgentUnavailable("guest agent not responding".into()));
        }
        let script = RESIZE_SCRIPT
            .replace("{W}", &width.to_string())
            .replace("{H}", &height.to_string());
        let out = self.exec(&script, Duration::from_secs(10), GuestShell::Sh)?;
        let mode = out.stdout.trim().to_string();
        tracing::info!(width, height, result = %mode, "guest display resized");
        Ok(mode)
    }
}

fn unwrap_return(command: &str, resp: Value) -> Result<Value> {
    if let Some(err) = resp.get("error") {
        return Err(Error::AgentProtocol(format!("{command}: {err}")));
    }
    Ok(resp.get("return").cloned().unwrap_or_else(|| json!({})))
}

fn decode_stream(status: &Value, key: &str) -> Result<String> {
    let Some(encoded) = status.get(key).and_then(Value::as_str) else {
        return Ok(String::new());
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| Error::AgentProtocol(format!("{key} is not base64: {e}")))?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

const RESIZE_SCRIPT: &str = r#"
for d in :0.0 :0 :1; do
    if DISPLAY=$d xrandr >/dev/null 2>&1; then
        export DISPLAY=$d
        break
    fi
done
for xa in /home/*/.Xauthority /root/.Xauthority; do
    if [ -f "$xa" ]; then
        export XAUTHORITY="$xa"
        break
    fi
done
OUTPUT=$(xrandr 2>/dev/null | grep ' connected' | head -1 | awk '{print $1}')
if [ -z "$OUTPUT" ]; then
    echo "ERROR: no connected output found"
    exit 1
fi
xrandr --output "$OUTPUT" --preferred 2>/dev/null
CURRENT=$(xrandr 2>/dev/null | grep '\*' | head -1 | awk '{print $1}')
if [ "$CURRENT" != "{W}x{H}" ]; then
    if xrandr 2>/dev/null | grep -q '{W}x{H}'; then
        xrandr --output "$OUTPUT" --mode {W}x{H} 2>/dev/null
    else
        MODELINE=$(cvt {W} {H} 60 2>/dev/null | grep Modeline | sed 's/Modeline //')
        MODENAME=$(echo "$MODELINE" | awk '{print $1}' | tr -d '"')
        if [ -n "$MODENAME" ]; then
            xrandr --newmode $MODELINE 2>/dev/null
            xrandr --addmode "$OUTPUT" "$MODENAME" 2>/dev/null
            xrandr --output "$OUTPUT" --mode "$MODENAME" 2>/dev/null
        fi
    fi
fi
xrandr 2>/dev/null | grep '\*' | head -1 | awk '{print $1}'
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::testing::{FakeAgent, ExecBehavior};
    use std::os::unix::net::UnixListener;
    use tempfile::TempDir;

    #[test]
    fn test_ping_missing_socket_is_false() {
        let tmp = TempDir::new().unwrap();
        assert!(!GuestAgent::new(tmp.path().join("qga.sock")).ping());
    }

    #[test]
    fn test_ping_unresponsive_agent_is_false() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("qga.sock");
        // Bound but never accepting: connect succeeds, no reply ever comes.
        let _listener = UnixListener::bind(&path).unwrap();
        let agent = GuestAgent::new(&path).with_timeout(Duration::from_millis(400));
        let started = Instant::now();
        assert!(!agent.ping());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_ping_and_query() {
        let fake = FakeAgent::start(ExecBehavior::Exit {
            stdout: String::new(),
            exit_code: 0,
        });
        let agent = GuestAgent::new(fake.socket());
        assert!(agent.ping());
        assert_eq!(
            agent.query("guest-get-host-name").unwrap()["host-name"],
            "guest01"
        );
        let err = agent.query("guest-no-such-command").unwrap_err();
        assert!(matches!(err, Error::AgentProtocol(_)));
    }

    #[test]
    fn test_exec_decodes_output() {
        let fake = FakeAgent::start(ExecBehavior::Exit {
            stdout: "hello\n".into(),
            exit_code: 3,
        });
        let agent = GuestAgent::new(fake.socket());
        let out = agent
            .exec("echo hello", Duration::from_secs(5), GuestShell::Sh)
            .unwrap();
        assert_eq!(out.stdout, "hello\n");
        assert_eq!(out.exit_code, 3);

        let req = fake.last_exec().unwrap();
        assert_eq!(req["path"], "/bin/sh");
        assert_eq!(req["arg"], json!(["-c", "echo hello"]));
        assert_eq!(req["capture-output"], true);
    }

    #[test]
    fn test_exec_shells() {
        let fake = FakeAgent::start(ExecBehavior::Exit {
            stdout: String::new(),
            exit_code: 0,
        });
        let agent = GuestAgent::new(fake.socket());
        agent
            .exec("ver", Duration::from_secs(5), GuestShell::PowerShell)
            .unwrap();
        let req = fake.last_exec().unwrap();
        assert_eq!(req["path"], "powershell.exe");
        assert_eq!(
            req["arg"],
            json!(["-NoProfile", "-NonInteractive", "-Command", "ver"])
        );
        assert_eq!(GuestShell::for_os(OsType::Windows), GuestShell::Cmd);
    }

    #[test]
    fn test_exec_timeout_is_bounded() {
        let fake = FakeAgent::start(ExecBehavior::Never);
        let agent = GuestAgent::new(fake.socket());
        let timeout = Duration::from_secs(1);
        let started = Instant::now();
        let err = agent.exec("sleep 60", timeout, GuestShell::Sh).unwrap_err();
        let elapsed = started.elapsed();
        assert!(matches!(err, Error::AgentTimeout(t) if t == timeout));
        assert!(
            elapsed < timeout + POLL_INTERVAL + Duration::from_millis(300),
            "took {elapsed:?}"
        );
    }

    #[test]
    fn test_resize_validates_range() {
        let agent = GuestAgent::new("/nonexistent/qga.sock");
        assert!(matches!(
            agent.resize_display(100, 100),
            Err(Error::Validation(_))
        ));
        assert!(matches!(
            agent.resize_display(1920, 1080),
            Err(Error::AgentUnavailable(_))
        ));
    }

    #[test]
    fn test_for_vm_dir_requires_socket() {
        let tmp = TempDir::new().unwrap();
        assert!(matches!(
            GuestAgent::for_vm_dir(tmp.path()),
            Err(Error::AgentUnavailable(_))
        ));
    }
}
