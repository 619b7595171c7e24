//! In-process stand-in for qemu-guest-agent, listening on a Unix socket.

use base64::Engine as _;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::os::unix::net::UnixListener;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// What `guest-exec-status` reports for a started command.
#[derive(Debug, Clone)]
pub(crate) enum ExecBehavior {
    Exit { stdout: String, exit_code: i64 },
    /// Never reports `exited`.
    Never,
}

type ExecFn = dyn Fn(&str) -> ExecBehavior + Send + Sync;

pub(crate) struct FakeAgent {
    _dir: Option<TempDir>,
    socket: PathBuf,
    last_exec: Arc<Mutex<Option<Value>>>,
}

impl FakeAgent {
    /// Agent in a private temp dir whose commands all behave the same.
    pub(crate) fn start(behavior: ExecBehavior) -> Self {
        let dir = TempDir::new().unwrap();
        let socket = dir.path().join("qga.sock");
        let mut fake = Self::serve(&socket, default_queries(), move |_| behavior.clone());
        fake._dir = Some(dir);
        fake
    }

    /// Agent at `<vm_dir>/qga.sock` with custom query replies and a
    /// per-command-line exec handler.
    pub(crate) fn start_in(
        vm_dir: &Path,
        queries: Vec<(&str, Value)>,
        exec: impl Fn(&str) -> ExecBehavior + Send + Sync + 'static,
    ) -> Self {
        let mut all = default_queries();
        for (k, v) in queries {
            all.insert(k.to_string(), v);
        }
        Self::serve(&vm_dir.join("qga.sock"), all, exec)
    }

    fn serve(
        socket: &Path,
        queries: HashMap<String, Value>,
        exec: impl Fn(&str) -> ExecBehavior + Send + Sync + 'static,
    ) -> Self {
        let listener = UnixListener::bind(socket).unwrap();
        let last_exec = Arc::new(Mutex::new(None));
        let seen = last_exec.clone();
        let exec: Box<ExecFn> = Box::new(exec);

        std::thread::spawn(move || {
            let mut running: HashMap<i64, ExecBehavior> = HashMap::new();
            let mut next_pid = 100;
            for conn in listener.incoming() {
                let Ok(mut conn) = conn else { break };
                let mut buf = Vec::new();
                let mut chunk = [0u8; 4096];
                while !buf.contains(&b'\n') {
                    match conn.read(&mut chunk) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                buf.retain(|b| *b != 0xFF);
                let Ok(req) = serde_json::from_slice::<Value>(buf.trim_ascii()) else {
                    continue;
                };
                let name = req["execute"].as_str().unwrap_or_default().to_string();
                let resp = match name.as_str() {
                    "guest-exec" => {
                        let args = req["arguments"].clone();
                        let cmdline = args["arg"]
                            .as_array()
                            .and_then(|a| a.last())
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string();
                        *seen.lock() = Some(args);
                        next_pid += 1;
                        running.insert(next_pid, exec(&cmdline));
                        json!({"return": {"pid": next_pid}})
                    }
                    "guest-exec-status" => {
                        let pid = req["arguments"]["pid"].as_i64().unwrap_or_default();
                        match running.get(&pid) {
                            Some(ExecBehavior::Exit { stdout, exit_code }) => json!({"return": {
                                "exited": true,
                                "exitcode": exit_code,
                                "out-data": base64::engine::general_purpose::STANDARD.encode(stdout),
                            }}),
                            Some(ExecBehavior::Never) => json!({"return": {"exited": false}}),
                            None => json!({"error": {"class": "GenericError", "desc": "no such pid"}}),
                        }
                    }
                    other => match queries.get(other) {
                        Some(v) => json!({"return": v}),
                        None => json!({"error": {
                            "class": "CommandNotFound",
                            "desc": format!("The command {other} has not been found"),
                        }}),
                    },
                };
                let mut line = serde_json::to_vec(&resp).unwrap();
                line.push(b'\n');
                let _ = conn.write_all(&line);
            }
        });

        Self {
            _dir: None,
            socket: socket.to_path_buf(),
            last_exec,
        }
    }

    pub(crate) fn socket(&self) -> PathBuf {
        self.socket.clone()
    }

    /// Arguments of the most recent `guest-exec`.
    pub(crate) fn last_exec(&self) -> Option<Value> {
        self.last_exec.lock().clone()
    }
}

fn default_queries() -> HashMap<String, Value> {
    HashMap::from([
        ("guest-ping".to_string(), json!({})),
        (
            "guest-get-host-name".to_string(),
            json!({"host-name": "guest01"}),
        ),
    ])
}
