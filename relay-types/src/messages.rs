//! Protocol frames and requests.
//!
//! Clients speak an event/acknowledgement protocol over WebSocket text
//! frames. Several events accept more than one argument shape (a bare channel
//! id from older clients, a structured object from newer ones); everything is
//! normalized into [`Request`] here so the server dispatches on one type.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

use crate::{ClientType, TypesError};

/// Plaintext control message type that marks a completed key exchange.
pub const KEY_HANDSHAKE_ACK: &str = "key_handshake_ACK";

/// Frame sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientFrame {
    /// Event name (`join_channel`, `message`, ...)
    pub event: String,
    /// Positional event arguments
    #[serde(default)]
    pub args: Vec<Value>,
    /// Callback id; when present the server answers exactly once
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ack: Option<u64>,
}

impl ClientFrame {
    /// Build a frame without a callback.
    pub fn new(event: impl Into<String>, args: Vec<Value>) -> Self {
        Self {
            event: event.into(),
            args,
            ack: None,
        }
    }

    /// Attach a callback id.
    pub fn with_ack(mut self, ack: u64) -> Self {
        self.ack = Some(ack);
        self
    }

    /// Parse a frame from WebSocket text.
    pub fn from_json(text: &str) -> Result<Self, TypesError> {
        serde_json::from_str(text).map_err(TypesError::MalformedFrame)
    }
}

/// Frame sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Server-initiated or relayed event
    Event {
        /// Event name, usually `<kind>-<channelId>`
        event: String,
        /// Positional arguments
        args: Vec<Value>,
    },
    /// Answer to a client callback: `[error, result]`
    Ack {
        /// Callback id from the client frame
        ack: u64,
        /// `[null, result]` on success, `[error]` on failure
        args: Vec<Value>,
    },
}

impl ServerFrame {
    /// Event frame with a single payload argument.
    pub fn event(name: impl Into<String>, payload: Value) -> Self {
        Self::Event {
            event: name.into(),
            args: vec![payload],
        }
    }

    /// Event frame with no arguments.
    pub fn bare_event(name: impl Into<String>) -> Self {
        Self::Event {
            event: name.into(),
            args: Vec::new(),
        }
    }

    /// Successful callback answer.
    pub fn ack_ok(ack: u64, result: Value) -> Self {
        Self::Ack {
            ack,
            args: vec![Value::Null, result],
        }
    }

    /// Failed callback answer.
    pub fn ack_err(ack: u64, error: &str) -> Self {
        Self::Ack {
            ack,
            args: vec![Value::String(error.to_string())],
        }
    }

    /// Event name, if this is an event frame.
    pub fn event_name(&self) -> Option<&str> {
        match self {
            Self::Event { event, .. } => Some(event),
            Self::Ack { .. } => None,
        }
    }

    /// Serialize to WebSocket text.
    pub fn to_json(&self) -> String {
        // A frame only holds JSON values and strings; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Server events scoped to a channel (emitted as `<prefix>-<channelId>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerEvent {
    /// Relayed or queued message
    Message,
    /// Liveness ping relayed to peers
    Ping,
    /// Only one peer present so far
    ClientsWaitingToJoin,
    /// Both peers present
    ClientsConnected,
    /// A peer left the room
    ClientsDisconnected,
    /// Channel configuration update (persistence, wallet key)
    Config,
    /// Wallet rejected the connection
    Rejected,
}

impl ServerEvent {
    /// Event name prefix.
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::Ping => "ping",
            Self::ClientsWaitingToJoin => "clients_waiting_to_join",
            Self::ClientsConnected => "clients_connected",
            Self::ClientsDisconnected => "clients_disconnected",
            Self::Config => "config",
            Self::Rejected => "rejected",
        }
    }

    /// Full event name for a channel.
    pub fn for_channel(self, channel_id: &str) -> String {
        format!("{}-{}", self.prefix(), channel_id)
    }
}

/// Message body: encrypted string or plaintext control object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessagePayload {
    /// Opaque ciphertext
    Encrypted(String),
    /// Plaintext control message (key exchange and friends)
    Control(Map<String, Value>),
}

impl MessagePayload {
    /// Whether this is the plaintext key-exchange acknowledgement.
    pub fn is_key_exchange_ack(&self) -> bool {
        match self {
            Self::Control(map) => map.get("type").and_then(Value::as_str) == Some(KEY_HANDSHAKE_ACK),
            Self::Encrypted(_) => false,
        }
    }

    /// Whether the payload is ciphertext.
    pub fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted(_))
    }

    /// JSON value as relayed to peers.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Encrypted(s) => Value::String(s.clone()),
            Self::Control(map) => Value::Object(map.clone()),
        }
    }
}

/// `create_channel` / `join_channel` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct JoinRequest {
    /// Raw channel id (validated by the server)
    pub channel_id: String,
    /// Role; absent for older clients
    pub client_type: Option<ClientType>,
    /// Free-form client context
    pub context: Option<String>,
    /// Wallet public key, sent by the wallet on join
    pub public_key: Option<String>,
}

/// `message` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageRequest {
    /// Raw channel id
    pub channel_id: String,
    /// Message body
    pub message: MessagePayload,
    /// Free-form client context
    pub context: Option<String>,
    /// Cleartext mirror for debugging
    pub plaintext: Option<String>,
    /// Sender role
    pub client_type: Option<ClientType>,
}

/// `ack` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct AckRequest {
    /// Raw channel id
    pub channel_id: String,
    /// Id of the queued message being acknowledged
    pub ack_id: String,
    /// Role whose queue holds the message
    pub client_type: Option<ClientType>,
}

/// `ping` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct PingRequest {
    /// Raw channel id
    pub channel_id: String,
    /// Sender role
    pub client_type: Option<ClientType>,
    /// Free-form client context
    pub context: Option<String>,
    /// Optional payload relayed to peers
    pub message: Option<Value>,
}

/// `rejected` arguments.
#[derive(Debug, Clone, PartialEq)]
pub struct RejectRequest {
    /// Raw channel id
    pub channel_id: String,
}

/// A protocol request, normalized from its wire shape.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    /// Create a channel (same semantics as join)
    CreateChannel(JoinRequest),
    /// Join or re-join a channel
    JoinChannel(JoinRequest),
    /// Relay a message to the peer
    Message(MessageRequest),
    /// Remove a queued message
    Ack(AckRequest),
    /// Liveness ping and queue flush
    Ping(PingRequest),
    /// Wallet declined the connection
    Rejected(RejectRequest),
    /// Leave a room
    LeaveChannel {
        /// Raw channel id
        channel_id: String,
    },
    /// Query local and cluster occupancy
    CheckRoom {
        /// Raw channel id
        channel_id: String,
    },
}

impl Request {
    /// Normalize a client frame into a request.
    pub fn from_frame(frame: &ClientFrame) -> Result<Self, TypesError> {
        let event = frame.event.as_str();
        match event {
            "create_channel" => Ok(Self::CreateChannel(join_request(frame)?)),
            "join_channel" => Ok(Self::JoinChannel(join_request(frame)?)),
            "message" => {
                let raw: RawMessage = arg(frame, 0)?;
                Ok(Self::Message(MessageRequest {
                    channel_id: raw.id,
                    message: raw.message,
                    context: raw.context,
                    plaintext: raw.plaintext,
                    client_type: raw.client_type,
                }))
            }
            "ack" => {
                let raw: RawAck = arg(frame, 0)?;
                Ok(Self::Ack(AckRequest {
                    channel_id: raw.channel_id,
                    ack_id: raw.ack_id,
                    client_type: raw.client_type,
                }))
            }
            "ping" => {
                let raw: RawPing = arg(frame, 0)?;
                Ok(Self::Ping(PingRequest {
                    channel_id: raw.id,
                    client_type: raw.client_type,
                    context: raw.context,
                    message: raw.message,
                }))
            }
            "rejected" => {
                let raw: ChannelRef = arg(frame, 0)?;
                Ok(Self::Rejected(RejectRequest {
                    channel_id: raw.into_id(),
                }))
            }
            "leave_channel" => {
                let raw: ChannelRef = arg(frame, 0)?;
                Ok(Self::LeaveChannel {
                    channel_id: raw.into_id(),
                })
            }
            "check_room" => {
                let raw: ChannelRef = arg(frame, 0)?;
                Ok(Self::CheckRoom {
                    channel_id: raw.into_id(),
                })
            }
            other => Err(TypesError::UnknownEvent(other.to_string())),
        }
    }

    /// Wire event name of this request.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CreateChannel(_) => "create_channel",
            Self::JoinChannel(_) => "join_channel",
            Self::Message(_) => "message",
            Self::Ack(_) => "ack",
            Self::Ping(_) => "ping",
            Self::Rejected(_) => "rejected",
            Self::LeaveChannel { .. } => "leave_channel",
            Self::CheckRoom { .. } => "check_room",
        }
    }

    /// Raw channel id the request targets.
    pub fn channel_id(&self) -> &str {
        match self {
            Self::CreateChannel(r) | Self::JoinChannel(r) => &r.channel_id,
            Self::Message(r) => &r.channel_id,
            Self::Ack(r) => &r.channel_id,
            Self::Ping(r) => &r.channel_id,
            Self::Rejected(r) => &r.channel_id,
            Self::LeaveChannel { channel_id } | Self::CheckRoom { channel_id } => channel_id,
        }
    }
}

fn arg<T: DeserializeOwned>(frame: &ClientFrame, index: usize) -> Result<T, TypesError> {
    let value = frame
        .args
        .get(index)
        .cloned()
        .ok_or_else(|| TypesError::InvalidArguments {
            event: frame.event.clone(),
            reason: format!("missing argument {index}"),
        })?;
    serde_json::from_value(value).map_err(|e| TypesError::InvalidArguments {
        event: frame.event.clone(),
        reason: e.to_string(),
    })
}

fn join_request(frame: &ClientFrame) -> Result<JoinRequest, TypesError> {
    let first: JoinArg = arg(frame, 0)?;
    Ok(match first {
        JoinArg::Legacy(channel_id) => JoinRequest {
            channel_id,
            client_type: None,
            context: frame
                .args
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string),
            public_key: None,
        },
        JoinArg::Structured(s) => JoinRequest {
            channel_id: s.channel_id,
            client_type: s.client_type,
            context: s.context,
            public_key: s.public_key,
        },
    })
}

/// Unknown role strings are treated as "no role" rather than an error, so
/// older clients sending an unexpected value still reach the legacy path.
fn lenient_client_type<'de, D: Deserializer<'de>>(d: D) -> Result<Option<ClientType>, D::Error> {
    let raw: Option<Value> = Option::deserialize(d)?;
    Ok(raw.and_then(|v| serde_json::from_value(v).ok()))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum JoinArg {
    Legacy(String),
    Structured(StructuredJoin),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StructuredJoin {
    channel_id: String,
    #[serde(default, deserialize_with = "lenient_client_type")]
    client_type: Option<ClientType>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    public_key: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessage {
    id: String,
    message: MessagePayload,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    plaintext: Option<String>,
    #[serde(default, deserialize_with = "lenient_client_type")]
    client_type: Option<ClientType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawAck {
    channel_id: String,
    ack_id: String,
    #[serde(default, deserialize_with = "lenient_client_type")]
    client_type: Option<ClientType>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPing {
    id: String,
    #[serde(default, deserialize_with = "lenient_client_type")]
    client_type: Option<ClientType>,
    #[serde(default)]
    context: Option<String>,
    #[serde(default)]
    message: Option<Value>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChannelRef {
    Bare(String),
    Object {
        #[serde(rename = "channelId")]
        channel_id: String,
    },
}

impl ChannelRef {
    fn into_id(self) -> String {
        match self {
            Self::Bare(id) => id,
            Self::Object { channel_id } => channel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CHANNEL: &str = "11111111-1111-1111-1111-111111111111";

    #[test]
    fn legacy_join_with_bare_id() {
        let frame = ClientFrame::new("join_channel", vec![json!(CHANNEL), json!("dapp-web")]);
        let req = Request::from_frame(&frame).unwrap();
        assert_eq!(
            req,
            Request::JoinChannel(JoinRequest {
                channel_id: CHANNEL.to_string(),
                client_type: None,
                context: Some("dapp-web".to_string()),
                public_key: None,
            })
        );
    }

    #[test]
    fn structured_join() {
        let frame = ClientFrame::new(
            "create_channel",
            vec![json!({
                "channelId": CHANNEL,
                "clientType": "wallet",
                "context": "mobile",
                "publicKey": "04ff"
            })],
        );
        match Request::from_frame(&frame).unwrap() {
            Request::CreateChannel(join) => {
                assert_eq!(join.client_type, Some(ClientType::Wallet));
                assert_eq!(join.public_key.as_deref(), Some("04ff"));
            }
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn unknown_client_type_is_dropped() {
        let frame = ClientFrame::new(
            "join_channel",
            vec![json!({ "channelId": CHANNEL, "clientType": "tablet" })],
        );
        match Request::from_frame(&frame).unwrap() {
            Request::JoinChannel(join) => assert_eq!(join.client_type, None),
            other => panic!("unexpected request: {other:?}"),
        }
    }

    #[test]
    fn join_without_arguments_fails() {
        let frame = ClientFrame::new("join_channel", vec![]);
        assert!(matches!(
            Request::from_frame(&frame),
            Err(TypesError::InvalidArguments { .. })
        ));
    }

    #[test]
    fn encrypted_and_control_messages() {
        let encrypted = ClientFrame::new(
            "message",
            vec![json!({ "id": CHANNEL, "message": "b64cipher", "clientType": "wallet" })],
        );
        let Request::Message(msg) = Request::from_frame(&encrypted).unwrap() else {
            panic!("expected message");
        };
        assert!(msg.message.is_encrypted());
        assert!(!msg.message.is_key_exchange_ack());

        let control = ClientFrame::new(
            "message",
            vec![json!({ "id": CHANNEL, "message": { "type": KEY_HANDSHAKE_ACK } })],
        );
        let Request::Message(msg) = Request::from_frame(&control).unwrap() else {
            panic!("expected message");
        };
        assert!(msg.message.is_key_exchange_ack());
        assert_eq!(msg.message.to_value(), json!({ "type": KEY_HANDSHAKE_ACK }));
    }

    #[test]
    fn numeric_message_body_is_rejected() {
        let frame = ClientFrame::new("message", vec![json!({ "id": CHANNEL, "message": 42 })]);
        assert!(Request::from_frame(&frame).is_err());
    }

    #[test]
    fn rejected_accepts_bare_or_object() {
        let bare = ClientFrame::new("rejected", vec![json!(CHANNEL)]);
        let object = ClientFrame::new("rejected", vec![json!({ "channelId": CHANNEL })]);
        assert_eq!(
            Request::from_frame(&bare).unwrap(),
            Request::from_frame(&object).unwrap()
        );
    }

    #[test]
    fn ack_request_fields() {
        let frame = ClientFrame::new(
            "ack",
            vec![json!({ "channelId": CHANNEL, "ackId": "abc", "clientType": "dapp" })],
        );
        let Request::Ack(ack) = Request::from_frame(&frame).unwrap() else {
            panic!("expected ack");
        };
        assert_eq!(ack.ack_id, "abc");
        assert_eq!(ack.client_type, Some(ClientType::Dapp));
    }

    #[test]
    fn unknown_event() {
        let frame = ClientFrame::new("subscribe", vec![]);
        assert!(matches!(
            Request::from_frame(&frame),
            Err(TypesError::UnknownEvent(e)) if e == "subscribe"
        ));
    }

    #[test]
    fn frame_parsing() {
        let frame =
            ClientFrame::from_json(r#"{"event":"check_room","args":["x"],"ack":3}"#).unwrap();
        assert_eq!(frame.ack, Some(3));
        assert!(ClientFrame::from_json("{not json").is_err());
    }

    #[test]
    fn server_frames_serialize() {
        let event = ServerFrame::event(ServerEvent::Ping.for_channel(CHANNEL), json!({"id": CHANNEL}));
        let text = event.to_json();
        assert!(text.contains("\"type\":\"event\""));
        assert!(text.contains(&format!("ping-{CHANNEL}")));

        let ack = ServerFrame::ack_err(9, "error_id");
        assert_eq!(
            serde_json::to_value(&ack).unwrap(),
            json!({ "type": "ack", "ack": 9, "args": ["error_id"] })
        );
    }

    #[test]
    fn event_names() {
        assert_eq!(
            ServerEvent::ClientsWaitingToJoin.for_channel("c"),
            "clients_waiting_to_join-c"
        );
        assert_eq!(ServerEvent::Config.for_channel("c"), "config-c");
    }
}
