//! Periodic housekeeping while the service runs: orphan websocket bridges,
//! dead VMs and leftover macvtap links.

use crate::vm::VmManager;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

/// Run `task` on the blocking pool every `period` until `shutdown` flips.
/// The first run happens one full period after the call.
pub async fn run_periodic<F>(period: Duration, mut shutdown: watch::Receiver<bool>, task: F)
where
    F: Fn() + Send + Sync + 'static,
{
    let task = Arc::new(task);
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let task = Arc::clone(&task);
                if let Err(e) = tokio::task::spawn_blocking(move || task()).await {
                    tracing::error!(error = %e, "maintenance pass panicked");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("maintenance loop stopped");
}

/// Sweep on the manager's configured interval.
pub async fn run(manager: Arc<VmManager>, shutdown: watch::Receiver<bool>) {
    let period = manager.settings().sweep_interval;
    tracing::info!(interval_secs = period.as_secs(), "maintenance sweeper started");
    run_periodic(period, shutdown, move || manager.periodic_sweep()).await;
}
