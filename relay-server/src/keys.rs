//! Store key naming.
//!
//! Keys written by this relay wrap the channel id in a hash tag
//! (`channel_config:{<id>}`) so a channel's config and both of its queues map
//! to the same cluster slot and can be pipelined together. Deployments that
//! predate the hash tag wrote `channel_config:<id>`; those keys are still read
//! as a fallback and copied forward.

use relay_types::{ChannelId, ClientType};

const CONFIG_PREFIX: &str = "channel_config";
const QUEUE_PREFIX: &str = "queue";
const OCCUPANCY_PREFIX: &str = "channel_occupancy";

/// Pub/sub channel prefix for cross-instance room broadcasts.
pub const ROOM_EVENTS_PREFIX: &str = "relay#";

/// A key in its current form plus the form older deployments used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedKey {
    /// Hash-tagged key; all writes go here.
    pub primary: String,
    /// Untagged key, read only when the primary is absent.
    pub legacy: String,
}

/// Key for the channel config record.
pub fn config(channel_id: &ChannelId) -> VersionedKey {
    VersionedKey {
        primary: format!("{CONFIG_PREFIX}:{{{channel_id}}}"),
        legacy: format!("{CONFIG_PREFIX}:{channel_id}"),
    }
}

/// Key for the pending-message queue of `role`.
pub fn queue(channel_id: &ChannelId, role: ClientType) -> VersionedKey {
    VersionedKey {
        primary: format!("{QUEUE_PREFIX}:{{{channel_id}}}:{role}"),
        legacy: format!("{QUEUE_PREFIX}:{channel_id}:{role}"),
    }
}

/// Key for the cluster-wide occupancy hash (`occupancy`, `timestamp` fields).
pub fn occupancy(channel_id: &ChannelId) -> String {
    format!("{OCCUPANCY_PREFIX}:{{{channel_id}}}")
}

/// Pub/sub channel carrying broadcasts for `room`.
pub fn room_events(room: &str) -> String {
    format!("{ROOM_EVENTS_PREFIX}{room}")
}

/// Pattern matching every room broadcast channel.
pub fn room_events_pattern() -> String {
    format!("{ROOM_EVENTS_PREFIX}*")
}

/// Hash tag of a key (the text between the first `{` and the following `}`),
/// which decides the cluster slot.
pub fn hash_tag(key: &str) -> Option<&str> {
    let open = key.find('{')?;
    let close = key[open + 1..].find('}')? + open + 1;
    let tag = &key[open + 1..close];
    (!tag.is_empty()).then_some(tag)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel() -> ChannelId {
        ChannelId::parse("11111111-1111-1111-1111-111111111111").unwrap()
    }

    #[test]
    fn config_key_forms() {
        let key = config(&channel());
        assert_eq!(key.primary, "channel_config:{11111111-1111-1111-1111-111111111111}");
        assert_eq!(key.legacy, "channel_config:11111111-1111-1111-1111-111111111111");
    }

    #[test]
    fn queue_key_forms() {
        let key = queue(&channel(), ClientType::Wallet);
        assert_eq!(key.primary, "queue:{11111111-1111-1111-1111-111111111111}:wallet");
        assert_eq!(key.legacy, "queue:11111111-1111-1111-1111-111111111111:wallet");
    }

    #[test]
    fn channel_keys_share_a_slot() {
        let id = channel();
        let tags = [
            config(&id).primary,
            queue(&id, ClientType::Dapp).primary,
            queue(&id, ClientType::Wallet).primary,
            occupancy(&id),
        ];
        for key in &tags {
            assert_eq!(hash_tag(key), Some(id.as_str()));
        }
        assert_eq!(hash_tag(&config(&id).legacy), None);
    }

    #[test]
    fn room_event_channels() {
        assert_eq!(room_events("abc"), "relay#abc");
        assert_eq!(room_events_pattern(), "relay#*");
    }

    #[test]
    fn hash_tag_edge_cases() {
        assert_eq!(hash_tag("a{}b"), None);
        assert_eq!(hash_tag("a{x"), None);
        assert_eq!(hash_tag("a{x}{y}"), Some("x"));
    }
}
