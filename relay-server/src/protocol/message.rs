//! `message`, `ack` and `ping`.

use super::{deliver_pending, parse_channel, Caller};
use crate::error::{ProtocolError, RelayError};
use crate::metrics::RelayMetrics;
use crate::server::Relay;
use relay_types::{
    AckRequest, ChannelId, ClientType, MessagePayload, MessageRequest, PingRequest, ServerEvent,
    ServerFrame,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn ensure_member(relay: &Relay, caller: &Caller, channel_id: &ChannelId) -> Result<(), RelayError> {
    if relay.adapter().is_member(&caller.socket_id, channel_id) {
        return Ok(());
    }
    tracing::warn!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        client_ip = %caller.ip,
        "Socket not in room"
    );
    Err(ProtocolError::NotInRoom.into())
}

pub(super) async fn handle_message(
    relay: &Arc<Relay>,
    caller: &Caller,
    req: MessageRequest,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(&req.channel_id)?;
    ensure_member(relay, caller, &channel_id)?;

    if let Err(e) = relay.rate_limits().check_message(caller.ip) {
        RelayMetrics::incr(&relay.metrics().rate_limit_hits);
        tracing::warn!(client_ip = %caller.ip, channel_id = %channel_id, "Message rate limited");
        return Err(e.into());
    }

    let result = relay_message(relay, caller, &channel_id, req).await;
    if result.is_err() {
        // Store trouble must not lock clients out.
        relay.rate_limits().relax();
    }
    result
}

async fn relay_message(
    relay: &Arc<Relay>,
    caller: &Caller,
    channel_id: &ChannelId,
    req: MessageRequest,
) -> Result<Value, RelayError> {
    let role = req.client_type;
    let mut config = match role {
        Some(_) => relay.registry().get(channel_id).await?,
        None => None,
    };

    let mut key_exchange_ack = false;
    if req.message.is_key_exchange_ack() && config.is_some() {
        config = relay.registry().mark_ready(channel_id, crate::now_ms()).await?;
        key_exchange_ack = config.is_some();
    }

    let ack_id = match (&req.message, role) {
        (MessagePayload::Encrypted(_), Some(role)) => Some(
            relay
                .queue()
                .enqueue(
                    channel_id,
                    role.other(),
                    req.message.to_value(),
                    req.plaintext.as_deref(),
                    crate::now_ms(),
                )
                .await?,
        ),
        _ => None,
    };

    tracing::info!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        client_ip = %caller.ip,
        role = role.map(ClientType::as_str).unwrap_or("unknown"),
        encrypted = req.message.is_encrypted(),
        ready = config.as_ref().is_some_and(|c| c.ready),
        context = req.context.as_deref().unwrap_or("-"),
        "Relaying message"
    );

    let adapter = relay.adapter();
    let frame = ServerFrame::event(
        ServerEvent::Message.for_channel(channel_id.as_str()),
        json!({ "id": channel_id.as_str(), "ackId": ack_id, "message": req.message.to_value() }),
    );
    adapter.broadcast(channel_id, Some(&caller.socket_id), frame).await;

    if let Some(config) = config.filter(|c| key_exchange_ack && c.persistence) {
        tracing::debug!(channel_id = %channel_id, "Channel supports relay persistence");
        let frame = ServerFrame::event(
            ServerEvent::Config.for_channel(channel_id.as_str()),
            json!({ "persistence": true, "walletKey": config.wallet_key }),
        );
        adapter.broadcast(channel_id, None, frame).await;
    }

    Ok(json!({ "id": channel_id.as_str(), "success": true }))
}

pub(super) async fn handle_ack(
    relay: &Arc<Relay>,
    caller: &Caller,
    req: AckRequest,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(&req.channel_id)?;
    let Some(role) = req.client_type else {
        return Err(ProtocolError::InvalidArguments("clientType is required".into()).into());
    };
    let removed = relay
        .queue()
        .acknowledge(&channel_id, role, &req.ack_id)
        .await?;
    tracing::debug!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        ack_id = %req.ack_id,
        removed,
        "Ack handled"
    );
    Ok(json!({ "success": true }))
}

pub(super) async fn handle_ping(
    relay: &Arc<Relay>,
    caller: &Caller,
    req: PingRequest,
) -> Result<Value, RelayError> {
    let channel_id = parse_channel(&req.channel_id)?;
    ensure_member(relay, caller, &channel_id)?;

    if let Err(e) = relay.rate_limits().check_message(caller.ip) {
        RelayMetrics::incr(&relay.metrics().rate_limit_hits);
        return Err(e.into());
    }
    relay.occupancy().touch(&channel_id).await?;

    tracing::debug!(
        channel_id = %channel_id,
        socket_id = %caller.socket_id,
        context = req.context.as_deref().unwrap_or("-"),
        "Ping"
    );

    if req.client_type == Some(ClientType::Dapp) {
        deliver_pending(relay, caller, &channel_id, ClientType::Dapp, Duration::ZERO);
    }

    let frame = ServerFrame::event(
        ServerEvent::Ping.for_channel(channel_id.as_str()),
        json!({ "id": channel_id.as_str(), "message": req.message }),
    );
    relay
        .adapter()
        .broadcast(&channel_id, Some(&caller.socket_id), frame)
        .await;
    Ok(Value::Bool(true))
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::config::Config;
    use crate::keys;
    use crate::store::{MemoryStore, Store};
    use relay_types::{
        AckRequest, ChannelId, ClientType, MessagePayload, MessageRequest, PingRequest, Request,
    };
    use serde_json::{json, Map, Value};
    use std::time::Duration;

    fn message(channel: &ChannelId, role: ClientType, payload: MessagePayload) -> Request {
        Request::Message(MessageRequest {
            channel_id: channel.to_string(),
            message: payload,
            context: None,
            plaintext: Some(r#"{"method":"eth_accounts"}"#.into()),
            client_type: Some(role),
        })
    }

    fn handshake_ack() -> MessagePayload {
        let mut map = Map::new();
        map.insert("type".into(), json!("key_handshake_ACK"));
        MessagePayload::Control(map)
    }

    fn ack(channel: &ChannelId, role: ClientType, ack_id: &str) -> Request {
        Request::Ack(AckRequest {
            channel_id: channel.to_string(),
            ack_id: ack_id.into(),
            client_type: Some(role),
        })
    }

    fn ping(channel: &ChannelId, role: ClientType) -> Request {
        Request::Ping(PingRequest {
            channel_id: channel.to_string(),
            client_type: Some(role),
            context: None,
            message: None,
        })
    }

    async fn paired(relay: &std::sync::Arc<crate::server::Relay>) -> (ChannelId, Client, Client) {
        let channel = ChannelId::random();
        let mut dapp = Client::connect(relay, 1);
        let mut wallet = Client::connect(relay, 2);
        dapp.send(relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();
        wallet
            .send(relay, join(&channel, Some(ClientType::Wallet)))
            .await
            .unwrap();
        dapp.events();
        wallet.events();
        (channel, dapp, wallet)
    }

    #[tokio::test]
    async fn encrypted_message_is_queued_for_peer() {
        let store = MemoryStore::new();
        let relay = relay_with(&store, fast_config());
        let channel = ChannelId::random();
        let dapp = Client::connect(&relay, 1);
        let wallet = Client::connect(&relay, 2);
        dapp.send(&relay, join(&channel, Some(ClientType::Dapp)))
            .await
            .unwrap();
        wallet
            .send(&relay, join(&channel, Some(ClientType::Wallet)))
            .await
            .unwrap();

        let reply = wallet
            .send(
                &relay,
                message(&channel, ClientType::Wallet, MessagePayload::Encrypted("c1".into())),
            )
            .await
            .unwrap();
        assert_eq!(reply, json!({"id": channel.as_str(), "success": true}));

        let pending = relay
            .queue()
            .list_pending(&channel, ClientType::Dapp)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, json!("c1"));
        assert_eq!(pending[0].plaintext, None);

        let raw = store
            .lrange(&keys::queue(&channel, ClientType::Dapp).primary, 0, -1)
            .await
            .unwrap();
        assert!(!raw[0].contains("eth_accounts"));
    }

    #[tokio::test]
    async fn message_reaches_peer_with_ack_id() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let (channel, mut dapp, mut wallet) = paired(&relay).await;

        dapp.send(
            &relay,
            message(&channel, ClientType::Dapp, MessagePayload::Encrypted("c".into())),
        )
        .await
        .unwrap();

        assert!(dapp.events().is_empty());
        let events = wallet.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, format!("message-{channel}"));
        assert_eq!(events[0].1["message"], json!("c"));
        assert!(events[0].1["ackId"].is_string());
    }

    #[tokio::test]
    async fn handshake_ack_marks_ready_and_announces_persistence() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let (channel, mut dapp, mut wallet) = paired(&relay).await;

        wallet
            .send(&relay, message(&channel, ClientType::Wallet, handshake_ack()))
            .await
            .unwrap();

        assert!(relay.registry().get(&channel).await.unwrap().unwrap().ready);
        let config_event = format!("config-{channel}");
        assert!(wallet.event_names().contains(&config_event));
        let dapp_events = dapp.event_names();
        assert_eq!(dapp_events, vec![format!("message-{channel}"), config_event]);

        // Control messages are relayed, never queued.
        assert!(relay
            .queue()
            .list_pending(&channel, ClientType::Dapp)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn message_outside_room_is_refused() {
        let relay = relay_with(&MemoryStore::new(), Config::default());
        let stranger = Client::connect(&relay, 9);
        let channel = ChannelId::random();
        let reply = stranger
            .send(
                &relay,
                message(&channel, ClientType::Dapp, MessagePayload::Encrypted("c".into())),
            )
            .await;
        assert_eq!(reply, Err("not in room".to_string()));
    }

    #[tokio::test]
    async fn store_error_relaxes_limits() {
        let store = MemoryStore::new();
        let mut config = fast_config();
        config.limits.enabled = true;
        let relay = relay_with(&store, config);
        let (channel, dapp, _wallet) = paired(&relay).await;

        store.fail_requests(true);
        let reply = dapp
            .send(
                &relay,
                message(&channel, ClientType::Dapp, MessagePayload::Encrypted("c".into())),
            )
            .await;
        store.fail_requests(false);

        assert!(reply.is_err());
        assert_eq!(relay.rate_limits().budgets(), (15, 150));
    }

    #[tokio::test]
    async fn ack_is_idempotent() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let (channel, dapp, wallet) = paired(&relay).await;

        for body in ["a", "b"] {
            wallet
                .send(
                    &relay,
                    message(&channel, ClientType::Wallet, MessagePayload::Encrypted(body.into())),
                )
                .await
                .unwrap();
        }
        let pending = relay
            .queue()
            .list_pending(&channel, ClientType::Dapp)
            .await
            .unwrap();
        let first = pending[0].ack_id.clone();

        dapp.send(&relay, ack(&channel, ClientType::Dapp, &first))
            .await
            .unwrap();
        dapp.send(&relay, ack(&channel, ClientType::Dapp, &first))
            .await
            .unwrap();

        let pending = relay
            .queue()
            .list_pending(&channel, ClientType::Dapp)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].message, json!("b"));
    }

    #[tokio::test]
    async fn dapp_ping_flushes_queue() {
        let relay = relay_with(&MemoryStore::new(), fast_config());
        let (channel, mut dapp, mut wallet) = paired(&relay).await;
        wallet
            .send(
                &relay,
                message(&channel, ClientType::Wallet, MessagePayload::Encrypted("q".into())),
            )
            .await
            .unwrap();
        dapp.events();

        let reply = dapp.send(&relay, ping(&channel, ClientType::Dapp)).await;
        assert_eq!(reply, Ok(Value::Bool(true)));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let events = dapp.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].1["message"], json!("q"));
        assert_eq!(events[0].1["channelId"], json!(channel.as_str()));
        assert_eq!(wallet.event_names(), vec![format!("ping-{channel}")]);
    }
}
