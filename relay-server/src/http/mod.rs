//! HTTP endpoints for the relay.
//!
//! Provides liveness, version, health, metrics, optional admin inspection,
//! and the WebSocket upgrade at `/ws`.

mod admin;
pub mod health;
mod metrics;

use crate::server::Relay;
use crate::session::ws_handler;
use axum::{routing::get, Extension, Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;

pub use health::HealthStatus;

/// Build the HTTP router with all endpoints.
pub fn build_router(relay: Arc<Relay>) -> Router {
    let mut router = Router::new()
        .route("/", get(root_handler))
        .route("/version", get(version_handler))
        .route("/health", get(health::health_handler))
        .route("/ws", get(ws_handler));

    if relay.config().http.metrics_enabled {
        router = router.route("/metrics", get(metrics::metrics_handler));
    }
    if relay.config().http.admin_ui {
        router = router.route("/admin/rooms", get(admin::rooms_handler));
    }

    router.layer(Extension(relay))
}

/// Liveness endpoint.
async fn root_handler() -> Json<Value> {
    Json(json!({ "success": true }))
}

async fn version_handler() -> Json<Value> {
    Json(json!({ "version": env!("CARGO_PKG_VERSION") }))
}
