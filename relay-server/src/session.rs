//! Per-connection session management.
//!
//! Each WebSocket connection gets a [`Session`] that registers a socket with
//! the room adapter, forwards outbound frames, and feeds inbound frames to
//! the dispatcher one at a time. On disconnect the socket leaves every room
//! it joined, which runs the occupancy leave hooks.

use crate::metrics::RelayMetrics;
use crate::protocol::{self, Caller};
use crate::server::Relay;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::Extension;
use futures_util::{SinkExt, StreamExt};
use relay_types::{ClientFrame, ServerFrame, SocketId};
use std::net::SocketAddr;
use std::sync::Arc;

/// WebSocket upgrade handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Extension(relay): Extension<Arc<Relay>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| Session::new(relay, addr).run(socket))
}

/// A per-connection session.
pub struct Session {
    relay: Arc<Relay>,
    caller: Caller,
}

impl Session {
    /// Create a new session for a connection from `addr`.
    pub fn new(relay: Arc<Relay>, addr: SocketAddr) -> Self {
        Self {
            relay,
            caller: Caller {
                socket_id: SocketId::new(),
                ip: addr.ip(),
            },
        }
    }

    /// Run the session until the client disconnects.
    pub async fn run(self, socket: WebSocket) {
        let socket_id = self.caller.socket_id.clone();
        RelayMetrics::incr(&self.relay.metrics().connections_total);
        tracing::info!(
            socket_id = %socket_id,
            client_ip = %self.caller.ip,
            sessions = self.relay.total_sessions() + 1,
            "New socket connection"
        );

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let mut outbound = self
            .relay
            .adapter()
            .register(socket_id.clone(), self.caller.ip);

        let forward_task = tokio::spawn(async move {
            while let Some(frame) = outbound.recv().await {
                if ws_sender.send(Message::Text(frame.to_json())).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        while let Some(next) = ws_receiver.next().await {
            match next {
                Ok(Message::Text(text)) => self.handle_text(&text).await,
                Ok(Message::Binary(_)) => {
                    tracing::debug!(socket_id = %socket_id, "Ignoring binary frame");
                }
                Ok(Message::Close(_)) => break,
                // axum answers pings itself
                Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
                Err(e) => {
                    tracing::debug!(socket_id = %socket_id, error = %e, "WebSocket error");
                    break;
                }
            }
        }

        self.relay.adapter().unregister(&socket_id).await;
        forward_task.abort();
        tracing::info!(socket_id = %socket_id, client_ip = %self.caller.ip, "Socket disconnected");
    }

    async fn handle_text(&self, text: &str) {
        match ClientFrame::from_json(text) {
            Ok(frame) => protocol::dispatch(&self.relay, &self.caller, frame).await,
            Err(e) => {
                tracing::warn!(
                    socket_id = %self.caller.socket_id,
                    client_ip = %self.caller.ip,
                    error = %e,
                    "Malformed frame"
                );
                // Best effort: answer the callback if the id can be recovered.
                if let Some(ack) = serde_json::from_str::<serde_json::Value>(text)
                    .ok()
                    .and_then(|v| v.get("ack").and_then(serde_json::Value::as_u64))
                {
                    self.relay
                        .adapter()
                        .emit_to(&self.caller.socket_id, ServerFrame::ack_err(ack, &e.to_string()));
                }
            }
        }
    }
}
