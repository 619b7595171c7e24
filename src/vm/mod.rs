//! VM orchestration: resources, processes, images and the registry.

pub mod allocator;
pub mod backup;
pub mod builder;
pub mod cloudinit;
pub mod disk;
pub mod firmware;
pub mod manager;
pub mod metrics;
pub mod network;
pub mod process;
pub mod store;
pub mod tpm;

#[cfg(test)]
pub(crate) mod testing;

/// Files inside a VM directory.
pub const DISK_FILE: &str = "disk.qcow2";
pub const EFI_VARS_FILE: &str = "efi_vars.fd";
pub const QEMU_PIDFILE: &str = "qemu.pid";
pub const QEMU_LOG: &str = "qemu.log";

pub use manager::{Backends, VmManager};
