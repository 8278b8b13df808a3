//! Admin inspection of local rooms (enabled by `http.admin_ui`).

use crate::server::Relay;
use axum::{Extension, Json};
use relay_types::ChannelId;
use serde::Serialize;
use std::sync::Arc;

/// One local room.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfo {
    /// Channel id.
    pub channel_id: String,
    /// Members connected to this instance.
    pub occupancy: usize,
    /// Cluster-wide counter, if the store answered.
    pub channel_occupancy: Option<i64>,
}

/// List local rooms with their local and cluster occupancy.
pub async fn rooms_handler(Extension(relay): Extension<Arc<Relay>>) -> Json<Vec<RoomInfo>> {
    let mut rooms = Vec::new();
    for (room, size) in relay.adapter().rooms() {
        let channel_occupancy = match ChannelId::parse(&room) {
            Ok(id) => match relay.occupancy().get(&id).await {
                Ok(record) => Some(record.occupancy),
                Err(e) => {
                    tracing::warn!(channel_id = %room, error = %e, "Occupancy lookup failed");
                    None
                }
            },
            Err(_) => None,
        };
        rooms.push(RoomInfo {
            channel_id: room,
            occupancy: size,
            channel_occupancy,
        });
    }
    Json(rooms)
}
