//! Identity types for the relay protocol.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::TypesError;

/// Identifier of a two-party channel.
///
/// Always a hyphenated UUID. The original spelling is kept as-is because it
/// becomes part of room names, event names and store keys, and clients
/// subscribe to those names verbatim.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ChannelId(String);

impl ChannelId {
    /// Parse and validate a channel id.
    pub fn parse(raw: &str) -> Result<Self, TypesError> {
        if raw.len() != 36 || uuid::Uuid::try_parse(raw).is_err() {
            return Err(TypesError::InvalidChannelId(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    /// Create a random channel id (for testing and clients).
    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// The channel id as sent by the client.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for ChannelId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        ChannelId::parse(&raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

impl AsRef<str> for ChannelId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Identifier of one WebSocket connection.
///
/// Assigned by the relay on connect; unique across instances.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SocketId(String);

impl SocketId {
    /// Create a new random SocketId.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    /// Wrap an existing id string.
    pub fn from_string(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SocketId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SocketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SocketId({})", self.0)
    }
}

/// The two roles that can occupy a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientType {
    /// The web application requesting a connection
    Dapp,
    /// The wallet answering it
    Wallet,
}

impl ClientType {
    /// The peer role on the other side of the channel.
    pub fn other(self) -> Self {
        match self {
            Self::Dapp => Self::Wallet,
            Self::Wallet => Self::Dapp,
        }
    }

    /// Lowercase wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dapp => "dapp",
            Self::Wallet => "wallet",
        }
    }
}

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_accepts_hyphenated_uuid() {
        let id = ChannelId::parse("11111111-1111-1111-1111-111111111111").unwrap();
        assert_eq!(id.as_str(), "11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn channel_id_keeps_original_spelling() {
        let id = ChannelId::parse("A0B1C2D3-E4F5-4A6B-8C7D-9E0F1A2B3C4D").unwrap();
        assert_eq!(id.to_string(), "A0B1C2D3-E4F5-4A6B-8C7D-9E0F1A2B3C4D");
    }

    #[test]
    fn channel_id_rejects_garbage() {
        assert!(ChannelId::parse("").is_err());
        assert!(ChannelId::parse("not-a-uuid").is_err());
        // Simple (unhyphenated) form is not accepted as a room name
        assert!(ChannelId::parse("11111111111111111111111111111111").is_err());
        assert!(ChannelId::parse("11111111-1111-1111-1111-11111111111z").is_err());
    }

    #[test]
    fn channel_id_deserialize_validates() {
        let ok: Result<ChannelId, _> =
            serde_json::from_str("\"11111111-1111-1111-1111-111111111111\"");
        assert!(ok.is_ok());
        let bad: Result<ChannelId, _> = serde_json::from_str("\"room-1\"");
        assert!(bad.is_err());
    }

    #[test]
    fn random_channel_ids_differ() {
        assert_ne!(ChannelId::random(), ChannelId::random());
    }

    #[test]
    fn socket_ids_are_unique() {
        let a = SocketId::new();
        let b = SocketId::new();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn client_type_other() {
        assert_eq!(ClientType::Dapp.other(), ClientType::Wallet);
        assert_eq!(ClientType::Wallet.other(), ClientType::Dapp);
    }

    #[test]
    fn client_type_wire_name() {
        assert_eq!(serde_json::to_string(&ClientType::Wallet).unwrap(), "\"wallet\"");
        let parsed: ClientType = serde_json::from_str("\"dapp\"").unwrap();
        assert_eq!(parsed, ClientType::Dapp);
    }
}
