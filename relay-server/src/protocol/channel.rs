//! `rejected`, `leave_channel` and `check_room`.

use super::{parse_channel, Caller};
use crate::error::{ProtocolError, RelayError};
use crate::occupancy::OccupancyTracker;
use crate::registry::RejectOutcome;
use crate::server::Relay;
use relay_types::{RejectRequest, ServerEvent, ServerFrame};
use serde_json::{json, Value};
use std::sync::Arc;

pub(super) async fn handle_rejected(
    relay: &Arc<Relay>,
    caller: &Caller,
    req: RejectRequest,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(&req.channel_id)?;
    let outcome = relay
        .registry()
        .mark_rejected(&channel_id, &caller.socket_id, crate::now_ms())
        .await?;

    match outcome {
        RejectOutcome::AlreadyReady(_) => Ok(json!({ "success": false })),
        RejectOutcome::Recorded(_) => {
            let frame = ServerFrame::event(
                ServerEvent::Rejected.for_channel(channel_id.as_str()),
                json!({ "channelId": channel_id.as_str() }),
            );
            relay
                .adapter()
                .broadcast(&channel_id, Some(&caller.socket_id), frame)
                .await;
            Ok(json!({ "success": true }))
        }
    }
}

pub(super) async fn handle_leave(
    relay: &Arc<Relay>,
    caller: &Caller,
    raw_channel_id: &str,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(raw_channel_id)?;
    if !relay.adapter().leave(&caller.socket_id, &channel_id).await {
        tracing::warn!(
            channel_id = %channel_id,
            socket_id = %caller.socket_id,
            "leave_channel for a room not joined"
        );
        return Err(ProtocolError::NotInRoom.into());
    }
    tracing::info!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        client_ip = %caller.ip,
        "Left channel"
    );
    Ok(Value::Bool(true))
}

pub(super) async fn handle_check_room(
    relay: &Arc<Relay>,
    caller: &Caller,
    raw_channel_id: &str,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(raw_channel_id)?;
    let local = relay.adapter().room_size(&channel_id);
    let cluster = relay.occupancy().get(&channel_id).await?.occupancy;
    OccupancyTracker::reconcile(&channel_id, local, cluster);

    tracing::info!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        occupancy = local,
        channel_occupancy = cluster,
        "check_room"
    );
    Ok(json!({ "occupancy": local, "channelOccupancy": cluster }))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::keys;
    use crate::store::MemoryStore;
    use relay_types::{ChannelId, ClientType, RejectRequest, Request};
    use serde_json::json;

    fn check_room(channel: &ChannelId) -> Request {
        Request::CheckRoom {
            channel_id: channel.to_string(),
        }
    }

    fn leave(channel: &ChannelId) -> Request {
        Request::LeaveChannel {
            channel_id: channel.to_string(),
        }
    }

    fn reject(channel: &ChannelId) -> Request {
        Request::Rejected(RejectRequest {
            channel_id: channel.to_string(),
        })
    }

    #[tokio::test]
    async fn check_room_reports_both_views() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let channel = ChannelId::random();
        let dapp = Client::connect(&relay, 1);
        dapp.send(&relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();

        let reply = dapp.send(&relay, check_room(&channel)).await.unwrap();
        assert_eq!(reply, json!({"occupancy": 1, "channelOccupancy": 1}));

        let bad = dapp
            .send(
                &relay,
                Request::CheckRoom {
                    channel_id: "nope".into(),
                },
            )
            .await;
        assert_eq!(bad, Err("error_id".to_string()));
    }

    #[tokio::test]
    async fn leave_updates_occupancy_and_notifies_peer() {
        let store = MemoryStore::new();
        let relay = relay_with(&store, fast_config());
        let channel = ChannelId::random();
        let dapp = Client::connect(&relay, 1);
        let mut wallet = Client::connect(&relay, 2);
        dapp.send(&relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();
        wallet
            .send(&relay, join(&channel, Some(ClientType::Wallet)))
            .await
            .unwrap();
        wallet.events();

        dapp.send(&relay, leave(&channel)).await.unwrap();
        assert_eq!(relay.occupancy().get(&channel).await.unwrap().occupancy, 1);
        assert_eq!(
            wallet.event_names(),
            vec![format!("clients_disconnected-{channel}")]
        );

        assert_eq!(
            dapp.send(&relay, leave(&channel)).await,
            Err("not in room".to_string())
        );

        wallet.send(&relay, leave(&channel)).await.unwrap();
        assert!(!store.contains(&keys::occupancy(&channel)));
    }

    #[tokio::test]
    async fn rejection_is_broadcast_and_blocks_rejoin() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let channel = ChannelId::random();
        let mut dapp = Client::connect(&relay, 1);
        let wallet = Client::connect(&relay, 2);
        dapp.send(&relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();
        wallet
            .send(&relay, join(&channel, Some(ClientType::Wallet)))
            .await
            .unwrap();
        dapp.events();

        let reply = wallet.send(&relay, reject(&channel)).await.unwrap();
        assert_eq!(reply, json!({"success": true}));
        assert_eq!(
            dapp.events(),
            vec![(
                format!("rejected-{channel}"),
                json!({"channelId": channel.as_str()})
            )]
        );

        let rejoin = dapp
            .send(&relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();
        assert_eq!(rejoin, json!({"rejected": true}));
    }

    #[tokio::test]
    async fn rejection_on_unknown_channel_creates_record() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let channel = ChannelId::random();
        let wallet = Client::connect(&relay, 2);

        let reply = wallet.send(&relay, reject(&channel)).await.unwrap();
        assert_eq!(reply, json!({"success": true}));
        let config = relay.registry().get(&channel).await.unwrap().unwrap();
        assert!(config.rejected);
        assert_eq!(
            config.client(ClientType::Wallet),
            Some(wallet.caller.socket_id.as_str())
        );
    }
}
