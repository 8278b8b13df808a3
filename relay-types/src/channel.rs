//! Records the relay keeps in the shared store.
//!
//! Field names are camelCase on the wire so records written by earlier relay
//! deployments remain readable.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ClientType;

/// Per-channel configuration record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelConfig {
    /// Current connection id per role (at most one per role).
    #[serde(default)]
    pub clients: BTreeMap<ClientType, String>,
    /// Both roles have joined at least once.
    #[serde(default)]
    pub persistence: bool,
    /// Key exchange acknowledged by both peers.
    #[serde(default)]
    pub ready: bool,
    /// Wallet public key, recorded the first time the wallet announces it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_key: Option<String>,
    /// Wallet declined the connection before key exchange.
    #[serde(default)]
    pub rejected: bool,
    /// Creation time (ms since epoch).
    pub created_at: i64,
    /// Last update time (ms since epoch).
    pub updated_at: i64,
}

impl ChannelConfig {
    /// Create a config with a single role slot filled.
    pub fn new(role: ClientType, socket_id: &str, now_ms: i64) -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(role, socket_id.to_string());
        Self {
            clients,
            persistence: false,
            ready: false,
            wallet_key: None,
            rejected: false,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Minimal record for a rejection that arrives before any join was
    /// recorded (the peers may be connected to different instances).
    pub fn rejected_by_wallet(wallet_socket_id: &str, now_ms: i64) -> Self {
        let mut clients = BTreeMap::new();
        clients.insert(ClientType::Wallet, wallet_socket_id.to_string());
        clients.insert(ClientType::Dapp, String::new());
        Self {
            clients,
            persistence: false,
            ready: false,
            wallet_key: None,
            rejected: true,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }

    /// Record `socket_id` in the slot for `role` and recompute persistence.
    pub fn set_client(&mut self, role: ClientType, socket_id: &str, now_ms: i64) {
        self.clients.insert(role, socket_id.to_string());
        self.persistence = self.filled_roles() == 2;
        self.updated_at = now_ms;
    }

    /// Number of role slots holding a connection id.
    pub fn filled_roles(&self) -> usize {
        self.clients.values().filter(|id| !id.is_empty()).count()
    }

    /// Connection id currently recorded for `role`, if any.
    pub fn client(&self, role: ClientType) -> Option<&str> {
        self.clients
            .get(&role)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }
}

/// One pending message in a recipient's queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedMessage {
    /// Unique id the recipient echoes back to remove the entry.
    pub ack_id: String,
    /// Opaque payload (encrypted string or plaintext control object).
    #[serde(default)]
    pub message: serde_json::Value,
    /// Cleartext mirror, only ever written in development mode.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plaintext: Option<String>,
    /// Enqueue time (ms since epoch).
    #[serde(default)]
    pub timestamp: i64,
}

impl QueuedMessage {
    /// Whether the entry carries a deliverable payload.
    pub fn has_body(&self) -> bool {
        match &self.message {
            serde_json::Value::Null => false,
            serde_json::Value::String(s) => !s.is_empty(),
            _ => true,
        }
    }
}

/// Cluster-wide occupancy of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OccupancyRecord {
    /// Number of connections currently joined to the room across instances.
    pub occupancy: i64,
    /// Last change (ms since epoch).
    pub timestamp: i64,
}
