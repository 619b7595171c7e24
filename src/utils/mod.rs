//! Small helpers shared across modules

pub mod paths;
pub mod system;
