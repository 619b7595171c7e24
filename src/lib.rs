//! qvmd - QEMU VM orchestration library
//!
//! VM lifecycle, disks, snapshots, backups, guest agent access and
//! browser console bridges for QEMU/KVM hosts.

pub mod agent;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod utils;
pub mod vm;

// Re-export commonly used types
pub use cli::commands::Cli;
pub use config::schema::{VmRecord, VmStatus, Volume};
pub use config::Settings;
pub use error::{Error, Result};
pub use vm::VmManager;
