//! Tracing setup for the `qvmd` binary.
//!
//! stderr output is always on and filtered by `RUST_LOG`. When `QVMD_LOG_DIR`
//! is set, a daily-rolling `qvmd.log` is written there as well.

use std::path::PathBuf;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub const LOG_DIR_ENV: &str = "QVMD_LOG_DIR";

/// Keep alive for the life of the process so buffered lines get flushed.
pub struct LogGuard {
    _file_guard: Option<tracing_appender::non_blocking::WorkerGuard>,
}

fn filter(default: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default))
}

/// Install the global subscriber. `verbose` raises the default level to debug.
pub fn init(verbose: bool) -> LogGuard {
    let default = if verbose { "qvmd=debug,info" } else { "info" };
    let stderr = fmt::layer().with_writer(std::io::stderr).with_target(false);

    let file_guard = match std::env::var_os(LOG_DIR_ENV).map(PathBuf::from) {
        Some(dir) => {
            let _ = std::fs::create_dir_all(&dir);
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "qvmd.log"));
            tracing_subscriber::registry()
                .with(filter(default))
                .with(stderr)
                .with(fmt::layer().with_writer(writer).with_ansi(false))
                .try_init()
                .ok();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(filter(default))
                .with(stderr)
                .try_init()
                .ok();
            None
        }
    };

    LogGuard {
        _file_guard: file_guard,
    }
}
