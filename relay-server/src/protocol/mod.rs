//! Protocol event dispatch.
//!
//! Every inbound frame is normalized into a [`Request`], handed to one
//! handler, and answered exactly once when the client supplied a callback
//! id. Handler failures never close the connection: they are logged with
//! the channel, socket and address, counted, and reported through the
//! callback.

mod channel;
mod join;
mod message;

use crate::error::{RelayError, StoreError};
use crate::metrics::{Operation, RelayMetrics};
use crate::server::Relay;
use relay_types::{ChannelId, ClientFrame, ClientType, Request, ServerEvent, ServerFrame, SocketId};
use serde_json::{json, Value};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The connection a request arrived on.
#[derive(Debug, Clone)]
pub struct Caller {
    /// Connection id.
    pub socket_id: SocketId,
    /// Source address, the rate limiting key.
    pub ip: IpAddr,
}

/// Callback payload: `Ok(result)` or the error text sent to the client.
pub type Reply = std::result::Result<Value, String>;

/// Handle one client frame.
pub async fn dispatch(relay: &Arc<Relay>, caller: &Caller, frame: ClientFrame) {
    let ack = frame.ack;
    let request = match Request::from_frame(&frame) {
        Ok(request) => request,
        Err(e) => {
            tracing::warn!(
                socket_id = %caller.socket_id,
                client_ip = %caller.ip,
                event = %frame.event,
                error = %e,
                "Rejected frame"
            );
            answer(relay, caller, ack, Err(e.to_string()));
            return;
        }
    };

    let reply = handle(relay, caller, request).await;
    answer(relay, caller, ack, reply);
}

/// Run a request through its handler and record the outcome.
pub async fn handle(relay: &Arc<Relay>, caller: &Caller, request: Request) -> Reply {
    let op = operation(&request);
    let channel_id = request.channel_id().to_string();
    let started = Instant::now();

    let result = match request {
        Request::CreateChannel(req) | Request::JoinChannel(req) => {
            join::handle_join(relay, caller, req).await
        }
        Request::Message(req) => message::handle_message(relay, caller, req).await,
        Request::Ack(req) => message::handle_ack(relay, caller, req).await,
        Request::Ping(req) => message::handle_ping(relay, caller, req).await,
        Request::Rejected(req) => channel::handle_rejected(relay, caller, req).await,
        Request::LeaveChannel { channel_id } => {
            channel::handle_leave(relay, caller, &channel_id).await
        }
        Request::CheckRoom { channel_id } => {
            channel::handle_check_room(relay, caller, &channel_id).await
        }
    };

    relay.metrics().observe(op, result.is_ok(), started.elapsed());
    result.map_err(|e| report(relay, caller, op, &channel_id, e))
}

fn operation(request: &Request) -> Operation {
    match request {
        Request::CreateChannel(_) | Request::JoinChannel(_) => Operation::JoinChannel,
        Request::Message(_) => Operation::Message,
        Request::Ack(_) => Operation::Ack,
        Request::Ping(_) => Operation::Ping,
        Request::Rejected(_) => Operation::Rejected,
        Request::LeaveChannel { .. } => Operation::LeaveChannel,
        Request::CheckRoom { .. } => Operation::CheckRoom,
    }
}

/// Log a handler error and turn it into callback text.
fn report(relay: &Relay, caller: &Caller, op: Operation, channel_id: &str, error: RelayError) -> String {
    match &error {
        RelayError::Store(e) => {
            RelayMetrics::incr(&relay.metrics().store_errors);
            tracing::error!(
                channel_id,
                socket_id = %caller.socket_id,
                client_ip = %caller.ip,
                operation = op.as_str(),
                error = %e,
                "Store error in handler"
            );
            client_message(e)
        }
        RelayError::Protocol(e) => {
            tracing::warn!(
                channel_id,
                socket_id = %caller.socket_id,
                client_ip = %caller.ip,
                operation = op.as_str(),
                "{}",
                e
            );
            e.to_string()
        }
        RelayError::RateLimited(e) => e.to_string(),
        other => {
            tracing::error!(
                channel_id,
                socket_id = %caller.socket_id,
                operation = op.as_str(),
                error = %other,
                "Handler failed"
            );
            "internal error".to_string()
        }
    }
}

fn client_message(error: &StoreError) -> String {
    match error {
        StoreError::PoolExhausted(_) | StoreError::PoolClosed | StoreError::Driver(_) => {
            "store unavailable".to_string()
        }
        other => other.to_string(),
    }
}

fn answer(relay: &Relay, caller: &Caller, ack: Option<u64>, reply: Reply) {
    let Some(ack) = ack else {
        return;
    };
    let frame = match reply {
        Ok(value) => ServerFrame::ack_ok(ack, value),
        Err(error) => ServerFrame::ack_err(ack, &error),
    };
    if !relay.adapter().emit_to(&caller.socket_id, frame) {
        tracing::debug!(socket_id = %caller.socket_id, ack, "Callback dropped, socket gone");
    }
}

/// Parse a channel id or fail with the client-facing invalid id error.
fn parse_channel(raw: &str) -> Result<ChannelId, RelayError> {
    ChannelId::parse(raw).map_err(|_| crate::error::ProtocolError::InvalidChannelId.into())
}

/// Event sent to the caller itself.
fn emit_self(relay: &Relay, caller: &Caller, event: ServerEvent, channel_id: &str, payload: Value) {
    relay
        .adapter()
        .emit_to(&caller.socket_id, ServerFrame::event(event.for_channel(channel_id), payload));
}

/// Send `role`'s queued messages to the caller, optionally after a delay.
///
/// Runs detached; a failure is logged and the client picks the messages up
/// on its next ping.
fn deliver_pending(
    relay: &Arc<Relay>,
    caller: &Caller,
    channel_id: &ChannelId,
    role: ClientType,
    delay: Duration,
) {
    let relay = relay.clone();
    let caller = caller.clone();
    let channel_id = channel_id.clone();
    tokio::spawn(async move {
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match relay.queue().list_pending(&channel_id, role).await {
            Ok(messages) => {
                tracing::debug!(
                    channel_id = %channel_id,
                    socket_id = %caller.socket_id,
                    role = %role,
                    count = messages.len(),
                    "Delivering queued messages"
                );
                for msg in messages {
                    let payload = json!({
                        "channelId": channel_id.as_str(),
                        "id": channel_id.as_str(),
                        "ackId": msg.ack_id,
                        "message": msg.message,
                    });
                    emit_self(&relay, &caller, ServerEvent::Message, channel_id.as_str(), payload);
                }
            }
            Err(e) => {
                RelayMetrics::incr(&relay.metrics().store_errors);
                tracing::error!(
                    channel_id = %channel_id,
                    socket_id = %caller.socket_id,
                    error = %e,
                    "Error retrieving queued messages"
                );
            }
        }
    });
}
