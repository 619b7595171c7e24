//! QEMU guest agent access: wire client and guest introspection.

pub mod info;
pub mod qga;

#[cfg(test)]
pub(crate) mod testing;

pub use info::{collect_guest_info, format_uptime, GuestInfo};
pub use qga::{ExecOutput, GuestAgent, GuestShell};
