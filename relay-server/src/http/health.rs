//! Health check endpoint.

use crate::server::Relay;
use axum::{Extension, Json};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;

/// Global start time for uptime calculation.
static START_TIME: std::sync::OnceLock<Instant> = std::sync::OnceLock::new();

/// Initialize the start time (call once at startup).
pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// Store section of the health response.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatus {
    /// Backend name (`memory`, `redis`, `redis-cluster`).
    pub backend: String,
    /// Whether the last probe succeeded.
    pub healthy: bool,
    /// Failed probes in a row.
    pub consecutive_failures: u32,
    /// Pool occupancy, for pooled backends.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pool: Option<crate::store::PoolState>,
}

/// Health status response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    /// Overall status.
    pub status: String,
    /// Server version.
    pub version: String,
    /// Shared store state.
    pub store: StoreStatus,
    /// Number of connected sockets on this instance.
    pub sockets: usize,
    /// Number of rooms with a local member.
    pub rooms: usize,
    /// Uptime in seconds.
    pub uptime_seconds: u64,
}

/// Health check handler.
pub async fn health_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<HealthStatus> {
    let uptime = START_TIME
        .get()
        .map(|start| start.elapsed().as_secs())
        .unwrap_or(0);
    let health = relay.store_health();

    Json(HealthStatus {
        status: if health.is_healthy() { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        store: StoreStatus {
            backend: relay.store().backend().to_string(),
            healthy: health.is_healthy(),
            consecutive_failures: health.consecutive_failures(),
            pool: relay.store().pool_state(),
        },
        sockets: relay.total_sessions(),
        rooms: relay.total_rooms(),
        uptime_seconds: uptime,
    })
}
