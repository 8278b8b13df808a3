//! Background liveness probe for the shared store.
//!
//! Runs periodically, counting consecutive ping failures. The driver owns
//! reconnection; the monitor only reports, and once the failure count hits
//! the threshold it logs a recovery attempt and starts counting again.

use super::Store;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;

/// Shared view of the probe results.
#[derive(Debug, Default)]
pub struct StoreHealth {
    healthy: AtomicBool,
    consecutive_failures: AtomicU32,
}

impl StoreHealth {
    /// Create a health record assumed healthy until the first probe.
    pub fn new() -> Self {
        Self {
            healthy: AtomicBool::new(true),
            consecutive_failures: AtomicU32::new(0),
        }
    }

    /// Whether the last probe succeeded.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Consecutive failed probes since the last success or recovery attempt.
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// Record one probe outcome.
    ///
    /// Returns `true` when the failure threshold was reached; the counter is
    /// reset in that case.
    pub fn record(&self, ok: bool, threshold: u32) -> bool {
        self.healthy.store(ok, Ordering::Relaxed);
        if ok {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return false;
        }
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= threshold {
            self.consecutive_failures.store(0, Ordering::Relaxed);
            return true;
        }
        false
    }
}

/// Spawn the health probe.
///
/// Returns a handle that can be used to abort the task.
pub fn spawn_health_monitor(
    store: Arc<dyn Store>,
    health: Arc<StoreHealth>,
    period: Duration,
    threshold: u32,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tracing::info!(
            "Store health monitor started (interval: {}s)",
            period.as_secs()
        );
        let mut timer = interval(period);

        loop {
            timer.tick().await;

            match store.ping().await {
                Ok(()) => {
                    if !health.is_healthy() {
                        tracing::info!("Store reachable again");
                    }
                    health.record(true, threshold);
                    if let Some(state) = store.pool_state() {
                        tracing::debug!(
                            size = state.size,
                            idle = state.idle,
                            in_use = state.in_use,
                            "Store pool state"
                        );
                    }
                }
                Err(e) => {
                    let failures = health.consecutive_failures() + 1;
                    tracing::warn!(error = %e, failures, "Store health check failed");
                    if health.record(false, threshold) {
                        tracing::error!(
                            threshold,
                            "Store unhealthy for {} consecutive checks, attempting recovery",
                            threshold
                        );
                    }
                }
            }
        }
    })
}
