//! Path utility functions

use crate::error::{Error, Result};
use std::path::{Component, Path, PathBuf};

/// Get the qvmd home directory path (`$QVMD_HOME`, else `~/qvmd`)
pub fn qvmd_home() -> Result<PathBuf> {
    if let Some(home) = std::env::var_os("QVMD_HOME") {
        return Ok(PathBuf::from(home));
    }
    Ok(dirs::home_dir()
        .ok_or_else(|| Error::Configuration("no home directory found; set QVMD_HOME".into()))?
        .join("qvmd"))
}

/// Resolve path under root directory
pub fn resolve_under_root(root: &Path, p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        root.join(p)
    }
}

/// True when `p` is relative and never climbs out of its base.
pub fn is_contained(p: &Path) -> bool {
    !p.as_os_str().is_empty()
        && p.components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Turn a display name into something safe for a file name.
pub fn sanitize_file_stem(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if s.is_empty() {
        "vm".to_string()
    } else {
        s
    }
}
