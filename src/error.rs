//! Error types for qvmd.
//!
//! Messages are lowercase and follow `"<operation> failed: <reason>"` or
//! `"<entity> not found: <identifier>"`, so they can be shown to an operator
//! unchanged.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using qvmd's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Port ranges handed out by the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortCategory {
    Vnc,
    Spice,
    Proxy,
}

impl std::fmt::Display for PortCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            PortCategory::Vnc => "vnc",
            PortCategory::Spice => "spice",
            PortCategory::Proxy => "websocket proxy",
        })
    }
}

/// Errors raised by the orchestration core.
#[derive(Error, Debug)]
pub enum Error {
    // ------------------------------------------------------------------
    // Lookup / lifecycle
    // ------------------------------------------------------------------
    /// Unknown VM, volume, snapshot or backup.
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Operation not permitted in the current lifecycle state.
    #[error("invalid vm state: {0}")]
    InvalidState(String),

    /// Rejected input (names, paths, sizes, archive members).
    #[error("validation failed: {0}")]
    Validation(String),

    /// Volume is already attached to another VM.
    #[error("volume {volume} is already attached to vm {owner}")]
    AttachmentConflict { volume: String, owner: String },

    /// Volume is not attached to the VM named in the request.
    #[error("volume {volume} is not attached to vm {vm}")]
    NotAttached { volume: String, vm: String },

    // ------------------------------------------------------------------
    // Host resources
    // ------------------------------------------------------------------
    /// Every port in the category's range is taken.
    #[error("no free {category} ports available")]
    ResourceExhausted { category: PortCategory },

    /// Missing host prerequisite; the message carries the remediation.
    #[error("host configuration error: {0}")]
    Configuration(String),

    // ------------------------------------------------------------------
    // Processes and external tools
    // ------------------------------------------------------------------
    /// A child process exited right after launch.
    #[error("process start failed: {command}: {log_excerpt}")]
    ProcessStartFailed { command: String, log_excerpt: String },

    /// An external tool returned a non-zero status.
    #[error("command '{command}' failed: {stderr}")]
    CommandFailed { command: String, stderr: String },

    // ------------------------------------------------------------------
    // Guest agent
    // ------------------------------------------------------------------
    /// Guest agent socket missing or agent not answering.
    #[error("guest agent unavailable: {0}")]
    AgentUnavailable(String),

    /// Guest command did not finish before its deadline.
    #[error("guest agent command timed out after {0:?}")]
    AgentTimeout(std::time::Duration),

    /// Agent replied with an error object or a malformed payload.
    #[error("guest agent protocol error: {0}")]
    AgentProtocol(String),

    // ------------------------------------------------------------------
    // Plumbing
    // ------------------------------------------------------------------
    #[error("i/o failed: {}: {source}", path.display())]
    PathIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub fn vm_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "vm",
            id: id.into(),
        }
    }

    pub fn volume_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "volume",
            id: id.into(),
        }
    }

    pub fn snapshot_not_found(id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: "snapshot",
            id: id.into(),
        }
    }

    /// Attach a path to an I/O error.
    pub fn io_at(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Error::PathIo {
            path: path.into(),
            source,
        }
    }

    /// HTTP status the API layer should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::InvalidState(_)
            | Error::Validation(_)
            | Error::AttachmentConflict { .. }
            | Error::NotAttached { .. } => 400,
            Error::AgentUnavailable(_) | Error::AgentTimeout(_) => 503,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(Error::vm_not_found("x").status_code(), 404);
        assert_eq!(Error::InvalidState("running".into()).status_code(), 400);
        assert_eq!(
            Error::AttachmentConflict {
                volume: "v".into(),
                owner: "a".into()
            }
            .status_code(),
            400
        );
        assert_eq!(
            Error::ResourceExhausted {
                category: PortCategory::Vnc
            }
            .status_code(),
            500
        );
        assert_eq!(Error::AgentUnavailable("x".into()).status_code(), 503);
    }

    #[test]
    fn test_messages_are_lowercase() {
        let e = Error::ResourceExhausted {
            category: PortCategory::Spice,
        };
        assert_eq!(e.to_string(), "no free spice ports available");
        assert_eq!(Error::volume_not_found("abc").to_string(), "volume not found: abc");
    }
}
