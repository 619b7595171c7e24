//! Guest introspection on top of the QGA client.
//!
//! Every field is best effort; only an agent that does not answer the
//! initial ping fails the whole collection.

use crate::agent::qga::{GuestAgent, GuestShell};
use crate::config::schema::OsType;
use crate::error::{Error, Result};
use chrono::NaiveDateTime;
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::time::Duration;

const FALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default, Serialize)]
pub struct GuestInfo {
    pub hostname: Option<String>,
    pub os: Option<Value>,
    pub interfaces: Option<Value>,
    pub users: Option<Value>,
    pub filesystems: Option<Vec<Value>>,
    pub uptime: Option<String>,
}

/// "Xd Yh Zm"; zero days and hours are dropped, minutes always shown.
pub fn format_uptime(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = secs % 86_400 / 3_600;
    let mins = secs % 3_600 / 60;
    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    parts.push(format!("{mins}m"));
    parts.join(" ")
}

/// `key=value` lines as printed by `wmic ... /value`.
fn wmic_values(out: &str) -> HashMap<String, String> {
    out.lines()
        .filter_map(|l| l.trim().split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

/// OS identity from `wmic os get caption,version /value`.
pub fn parse_wmic_os(out: &str) -> Option<Value> {
    let values = wmic_values(out);
    let name = values.get("Caption").filter(|s| !s.is_empty())?;
    Some(json!({
        "pretty-name": name,
        "version": values.get("Version").cloned().unwrap_or_default(),
        "id": "mswindows",
    }))
}

/// Drive letter -> (total, used) from
/// `wmic logicaldisk get caption,size,freespace /format:csv`
/// (columns: Node,Caption,FreeSpace,Size).
pub fn parse_wmic_disks(out: &str) -> HashMap<String, (u64, u64)> {
    out.lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.trim().split(',').collect();
            if parts.len() < 4 || parts[1].is_empty() || parts[1] == "Caption" {
                return None;
            }
            let parse = |s: &str| if s.is_empty() { Some(0) } else { s.parse::<u64>().ok() };
            let free = parse(parts[2])?;
            let total = parse(parts[3])?;
            Some((
                parts[1].trim_end_matches('\\').to_string(),
                (total, total.saturating_sub(free)),
            ))
        })
        .collect()
}

/// Mount point -> (total, used) from `df -B1 --output=target,size,used`.
pub fn parse_df(out: &str) -> HashMap<String, (u64, u64)> {
    out.lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 3 {
                return None;
            }
            Some((
                parts[0].to_string(),
                (parts[1].parse().ok()?, parts[2].parse().ok()?),
            ))
        })
        .collect()
}

/// Whole seconds from `/proc/uptime`.
pub fn parse_proc_uptime(out: &str) -> Option<u64> {
    let secs: f64 = out.split_whitespace().next()?.parse().ok()?;
    (secs >= 0.0).then_some(secs as u64)
}

/// Boot time from `wmic os get lastbootuptime /value`
/// (`LastBootUpTime=YYYYMMDDHHMMSS.ffffff+ZZZ`).
pub fn parse_wmic_boot(out: &str) -> Option<NaiveDateTime> {
    let values = wmic_values(out);
    let ts = values.get("LastBootUpTime")?;
    let stamp = ts.get(..14)?;
    NaiveDateTime::parse_from_str(stamp, "%Y%m%d%H%M%S").ok()
}

fn has_byte_counts(filesystems: &[Value]) -> bool {
    filesystems
        .iter()
        .any(|fs| fs.get("total-bytes").and_then(Value::as_u64).unwrap_or(0) > 0)
}

/// Fill `total-bytes`/`used-bytes` on entries whose mountpoint is in `sizes`.
pub fn enrich_filesystems(
    filesystems: &mut [Value],
    sizes: &HashMap<String, (u64, u64)>,
    strip_backslash: bool,
) {
    for fs in filesystems.iter_mut().filter_map(Value::as_object_mut) {
        let Some(mp) = fs.get("mountpoint").and_then(Value::as_str) else {
            continue;
        };
        let key = if strip_backslash {
            mp.trim_end_matches('\\')
        } else {
            mp
        };
        if let Some((total, used)) = sizes.get(key).copied() {
            fs.insert("total-bytes".into(), json!(total));
            fs.insert("used-bytes".into(), json!(used));
        }
    }
}

fn best_effort<T>(what: &str, r: Result<T>) -> Option<T> {
    match r {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::debug!(field = what, error = %e, "guest info field unavailable");
            None
        }
    }
}

fn run(agent: &GuestAgent, command: &str, shell: GuestShell) -> Option<String> {
    best_effort(command, agent.exec(command, FALLBACK_TIMEOUT, shell))
        .map(|o| o.stdout)
        .filter(|s| !s.trim().is_empty())
}

/// Hostname, OS, interfaces, users, filesystems and uptime of a guest.
pub fn collect_guest_info(agent: &GuestAgent, os: OsType) -> Result<GuestInfo> {
    if !agent.ping() {
        return Err(Error::AgentUnavailable(
            "guest agent not responding (is qemu-guest-agent installed and running?)".into(),
        ));
    }
    let windows = os == OsType::Windows;
    let mut info = GuestInfo {
        hostname: best_effort("hostname", agent.query("guest-get-host-name")).and_then(|v| {
            v.get("host-name")
                .and_then(Value::as_str)
                .map(str::to_string)
        }),
        os: best_effort("os", agent.query("guest-get-osinfo")),
        interfaces: best_effort("interfaces", agent.query("guest-network-get-interfaces")),
        users: best_effort("users", agent.query("guest-get-users")),
        filesystems: best_effort("filesystems", agent.query("guest-get-fsinfo"))
            .and_then(|v| v.as_array().cloned()),
        uptime: None,
    };

    if info.os.is_none() && windows {
        info.os = run(agent, "wmic os get caption,version /value", GuestShell::Cmd)
            .and_then(|out| parse_wmic_os(&out));
    }

    if let Some(filesystems) = info.filesystems.as_mut() {
        if !has_byte_counts(filesystems) {
            if windows {
                if let Some(out) = run(
                    agent,
                    "wmic logicaldisk get caption,size,freespace /format:csv",
                    GuestShell::Cmd,
                ) {
                    enrich_filesystems(filesystems, &parse_wmic_disks(&out), true);
                }
            } else if let Some(out) = run(
                agent,
                "df -B1 --output=target,size,used 2>/dev/null",
                GuestShell::Sh,
            ) {
                enrich_filesystems(filesystems, &parse_df(&out), false);
            }
        }
    }

    info.uptime = if windows {
        run(agent, "wmic os get lastbootuptime /value", GuestShell::Cmd)
            .and_then(|out| parse_wmic_boot(&out))
            .map(|boot| {
                let secs = (chrono::Local::now().naive_local() - boot).num_seconds();
                format_uptime(secs.max(0) as u64)
            })
    } else {
        run(agent, "cat /proc/uptime 2>/dev/null", GuestShell::Sh)
            .and_then(|out| parse_proc_uptime(&out))
            .map(format_uptime)
    };

    Ok(info)
}
