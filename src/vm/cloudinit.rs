//! NoCloud seed images (`cidata` ISO with `user-data` and `meta-data`).

use crate::error::{Error, Result};
use crate::utils::system::run_tool;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

static HOSTNAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9]([A-Za-z0-9-]{0,61}[A-Za-z0-9])?$").expect("valid regex")
});
static USERNAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_][a-z0-9_-]{0,31}$").expect("valid regex"));

const ISO_TOOLS: [&str; 3] = ["genisoimage", "mkisofs", "xorriso"];

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CloudInitConfig {
    pub hostname: String,
    pub username: String,
    /// Plain text, or a crypt(3) hash when it starts with `$`.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub ssh_keys: Vec<String>,
    #[serde(default)]
    pub packages: Vec<String>,
}

impl CloudInitConfig {
    pub fn validate(&self) -> Result<()> {
        if !HOSTNAME_RE.is_match(&self.hostname) {
            return Err(Error::Validation(format!(
                "invalid hostname: {:?}",
                self.hostname
            )));
        }
        if !USERNAME_RE.is_match(&self.username) {
            return Err(Error::Validation(format!(
                "invalid username: {:?}",
                self.username
            )));
        }
        if self.ssh_keys.iter().any(|k| k.contains('\n')) {
            return Err(Error::Validation("ssh keys must be single lines".into()));
        }
        Ok(())
    }

    /// `#cloud-config` document. The body is JSON, which YAML parsers accept.
    pub fn user_data(&self) -> Result<String> {
        let mut user = json!({
            "name": self.username,
            "groups": ["sudo"],
            "shell": "/bin/bash",
            "sudo": "ALL=(ALL) NOPASSWD:ALL",
        });
        if !self.ssh_keys.is_empty() {
            user["ssh_authorized_keys"] = json!(self.ssh_keys);
        }

        let mut doc = json!({
            "hostname": self.hostname,
            "manage_etc_hosts": true,
            "users": [],
        });
        match self.password.as_deref() {
            Some(hash) if hash.starts_with('$') => {
                user["passwd"] = json!(hash);
                user["lock_passwd"] = json!(false);
            }
            Some(plain) => {
                user["lock_passwd"] = json!(false);
                doc["chpasswd"] = json!({
                    "expire": false,
                    "users": [{"name": self.username, "password": plain, "type": "text"}],
                });
                doc["ssh_pwauth"] = json!(true);
            }
            None => {}
        }
        doc["users"] = Value::Array(vec![user]);
        if !self.packages.is_empty() {
            doc["package_update"] = json!(true);
            doc["packages"] = json!(self.packages);
        }
        Ok(format!(
            "#cloud-config\n{}\n",
            serde_json::to_string_pretty(&doc)?
        ))
    }

    pub fn meta_data(&self) -> String {
        format!(
            "instance-id: {}\nlocal-hostname: {}\n",
            uuid::Uuid::new_v4(),
            self.hostname
        )
    }
}

/// First ISO authoring tool on `PATH`.
pub fn find_iso_tool() -> Result<PathBuf> {
    ISO_TOOLS
        .iter()
        .find_map(|t| which::which(t).ok())
        .ok_or_else(|| {
            Error::Configuration(
                "no ISO generation tool found; install genisoimage (or xorriso)".into(),
            )
        })
}

/// Build the seed ISO at `dest` with `tool`.
pub fn build_seed_iso(tool: &Path, cfg: &CloudInitConfig, dest: &Path) -> Result<()> {
    cfg.validate()?;
    let work = tempfile::tempdir()?;
    let user_data = work.path().join("user-data");
    let meta_data = work.path().join("meta-data");
    fs::write(&user_data, cfg.user_data()?).map_err(|e| Error::io_at(&user_data, e))?;
    fs::write(&meta_data, cfg.meta_data()).map_err(|e| Error::io_at(&meta_data, e))?;
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).map_err(|e| Error::io_at(parent, e))?;
    }

    let mut cmd = Command::new(tool);
    if tool.file_name().is_some_and(|n| n == "xorriso") {
        cmd.args(["-as", "mkisofs"]);
    }
    cmd.arg("-output")
        .arg(dest)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(&user_data)
        .arg(&meta_data);
    run_tool(&mut cmd)?;
    tracing::info!(iso = %dest.display(), hostname = %cfg.hostname, "cloud-init seed created");
    Ok(())
}
