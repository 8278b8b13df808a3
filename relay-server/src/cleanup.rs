//! Background maintenance for the rate limiters.
//!
//! Runs periodically to restore relaxed budgets once errors have stopped and
//! to evict addresses whose buckets have fully recharged.

use crate::server::Relay;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Spawn the limiter maintenance task.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_limits_maintenance(relay: Arc<Relay>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let limits = relay.rate_limits();
        if !limits.enabled() {
            tracing::info!("Rate limiter disabled, maintenance task not started");
            return;
        }

        let interval_secs = relay.config().limits.maintenance_interval_secs.max(1);
        tracing::info!("Limiter maintenance started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));

        loop {
            timer.tick().await;
            run_maintenance(&relay);
        }
    })
}

fn run_maintenance(relay: &Relay) {
    let limits = relay.rate_limits();
    if limits.reset_if_recovered() {
        tracing::info!("Maintenance: rate limits back to configured budgets");
    }
    let before = limits.tracked_keys();
    limits.shrink();
    let after = limits.tracked_keys();
    tracing::debug!(
        "Maintenance: tracked addresses join {}->{} message {}->{}",
        before.0,
        after.0,
        before.1,
        after.1
    );
}
