//! Operator command line.

pub mod commands;
pub mod completions;

pub use commands::Cli;
