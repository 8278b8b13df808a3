//! `create_channel` / `join_channel`.

use super::{deliver_pending, emit_self, Caller};
use crate::error::{ProtocolError, RelayError};
use crate::metrics::RelayMetrics;
use crate::occupancy::MAX_CLIENTS_PER_ROOM;
use crate::registry::JoinOutcome;
use crate::server::Relay;
use relay_types::{ChannelId, ClientType, JoinRequest, ServerEvent, ServerFrame};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

pub(super) async fn handle_join(
    relay: &Arc<Relay>,
    caller: &Caller,
    req: JoinRequest,
) -> Result<Value, RelayError> {
    if let Err(e) = relay.rate_limits().check_join(caller.ip) {
        RelayMetrics::incr(&relay.metrics().rate_limit_hits);
        tracing::warn!(client_ip = %caller.ip, socket_id = %caller.socket_id, "Join rate limited");
        return Err(e.into());
    }

    let Ok(channel_id) = ChannelId::parse(&req.channel_id) else {
        tracing::error!(
            channel_id = %req.channel_id,
            socket_id = %caller.socket_id,
            client_ip = %caller.ip,
            "Invalid channel id"
        );
        emit_self(
            relay,
            caller,
            ServerEvent::Message,
            &req.channel_id,
            json!({ "error": "must specify a valid id" }),
        );
        return Err(ProtocolError::InvalidChannelId.into());
    };
    let role = req.client_type;
    let adapter = relay.adapter();

    if !adapter.is_member(&caller.socket_id, &channel_id) {
        let record = relay.occupancy().get(&channel_id).await?;
        if record.occupancy >= MAX_CLIENTS_PER_ROOM {
            tracing::warn!(
                channel_id = %channel_id,
                socket_id = %caller.socket_id,
                occupancy = record.occupancy,
                "Room already full"
            );
            emit_self(
                relay,
                caller,
                ServerEvent::Message,
                channel_id.as_str(),
                json!({ "error": "room already full" }),
            );
            return Err(ProtocolError::RoomFull.into());
        }
    }

    let outcome = relay
        .registry()
        .get_or_create(
            &channel_id,
            role,
            &caller.socket_id,
            req.public_key.as_deref(),
            crate::now_ms(),
        )
        .await?;

    let (config, wallet_key_added) = match outcome {
        JoinOutcome::Rejected(_) => return Ok(json!({ "rejected": true })),
        JoinOutcome::Joined {
            config,
            wallet_key_added,
        } => (config, wallet_key_added),
    };

    if wallet_key_added {
        if let Some(config) = &config {
            tracing::info!(channel_id = %channel_id, "Wallet key recorded, informing peer");
            let frame = ServerFrame::event(
                ServerEvent::Config.for_channel(channel_id.as_str()),
                json!({ "walletKey": config.wallet_key, "persistence": config.persistence }),
            );
            adapter.broadcast(&channel_id, Some(&caller.socket_id), frame).await;
        }
    }

    let occupancy = match adapter.join(&caller.socket_id, &channel_id).await? {
        Some(occupancy) => occupancy,
        None => {
            tracing::warn!(
                channel_id = %channel_id,
                socket_id = %caller.socket_id,
                "Socket already in room"
            );
            relay.occupancy().get(&channel_id).await?.occupancy
        }
    };

    let ready = config.as_ref().is_some_and(|c| c.ready);
    let persistence = config.as_ref().is_some_and(|c| c.persistence);
    let delay = Duration::from_millis(relay.config().channels.delivery_delay_ms);

    tracing::info!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        client_ip = %caller.ip,
        role = role.map(ClientType::as_str).unwrap_or("unknown"),
        ready,
        persistence,
        occupancy,
        room_size = adapter.room_size(&channel_id),
        "Joined channel"
    );

    // The dapp reconnected before key exchange finished: hand it the wallet
    // key so it can restart the handshake.
    if let Some(config) = config.as_ref().filter(|c| !c.ready) {
        if role == Some(ClientType::Dapp) {
            if let Some(wallet_key) = &config.wallet_key {
                deliver_pending(relay, caller, &channel_id, ClientType::Dapp, delay);
                return Ok(json!({
                    "ready": false,
                    "persistence": persistence,
                    "walletKey": wallet_key,
                }));
            }
        }
    }

    if occupancy < MAX_CLIENTS_PER_ROOM {
        emit_self(
            relay,
            caller,
            ServerEvent::ClientsWaitingToJoin,
            channel_id.as_str(),
            json!(occupancy),
        );
    } else {
        let frame = ServerFrame::event(
            ServerEvent::ClientsConnected.for_channel(channel_id.as_str()),
            json!(channel_id.as_str()),
        );
        adapter.broadcast(&channel_id, None, frame).await;
    }

    if let (true, Some(role)) = (ready, role) {
        deliver_pending(relay, caller, &channel_id, role, delay);
    }

    Ok(json!({
        "success": true,
        "ready": ready,
        "persistence": persistence,
    }))
}
