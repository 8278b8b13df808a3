//! Per-recipient pending message queues.
//!
//! Each `(channel, role)` pair owns a FIFO list of JSON-encoded
//! [`QueuedMessage`] entries. Entries are removed by `ackId`: the store has
//! no atomic delete-by-position, so the matched slot is first overwritten
//! with a unique placeholder and the placeholder is then removed by value.
//! Concurrent appends may shift indices but never change what a placeholder
//! matches.

use crate::error::StoreResult;
use crate::keys::{self, VersionedKey};
use crate::metrics::RelayMetrics;
use crate::store::{BatchOp, Store};
use relay_types::{ChannelId, ClientType, QueuedMessage};
use serde_json::Value;
use std::sync::Arc;

/// Prefix of the transient placeholder written during removal.
const PLACEHOLDER_PREFIX: &str = "TO_REMOVE_";

/// Pending-message queues for all channels.
#[derive(Clone)]
pub struct MessageQueue {
    store: Arc<dyn Store>,
    metrics: Arc<RelayMetrics>,
    expiry_secs: u64,
    development: bool,
}

impl std::fmt::Debug for MessageQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageQueue")
            .field("expiry_secs", &self.expiry_secs)
            .field("development", &self.development)
            .finish_non_exhaustive()
    }
}

impl MessageQueue {
    /// Create a queue manager. `development` enables the plaintext mirror.
    pub fn new(
        store: Arc<dyn Store>,
        metrics: Arc<RelayMetrics>,
        expiry_secs: u64,
        development: bool,
    ) -> Self {
        Self {
            store,
            metrics,
            expiry_secs,
            development,
        }
    }

    /// Append a message to `recipient`'s queue and refresh the queue TTL.
    ///
    /// Returns the generated `ackId`.
    pub async fn enqueue(
        &self,
        channel_id: &ChannelId,
        recipient: ClientType,
        message: Value,
        plaintext: Option<&str>,
        now_ms: i64,
    ) -> StoreResult<String> {
        let ack_id = uuid::Uuid::new_v4().to_string();
        let entry = QueuedMessage {
            ack_id: ack_id.clone(),
            message,
            plaintext: if self.development {
                plaintext.map(pretty_plaintext)
            } else {
                None
            },
            timestamp: now_ms,
        };

        let key = keys::queue(channel_id, recipient).primary;
        let raw = serde_json::to_string(&entry)?;
        self.store.rpush(&key, &raw).await?;
        self.store.expire(&key, self.expiry_secs).await?;

        RelayMetrics::incr(&self.metrics.messages_queued);
        tracing::debug!(
            channel_id = %channel_id,
            role = %recipient,
            ack_id = %ack_id,
            "Message queued"
        );
        Ok(ack_id)
    }

    /// Pending messages for `role`, oldest first.
    ///
    /// Entries that fail to parse or carry no body are skipped.
    pub async fn list_pending(
        &self,
        channel_id: &ChannelId,
        role: ClientType,
    ) -> StoreResult<Vec<QueuedMessage>> {
        let (_, raw) = self.read(channel_id, role).await?;
        let messages = raw
            .iter()
            .filter(|entry| !entry.starts_with(PLACEHOLDER_PREFIX))
            .filter_map(|entry| match serde_json::from_str::<QueuedMessage>(entry) {
                Ok(msg) => Some(msg),
                Err(e) => {
                    tracing::error!(
                        channel_id = %channel_id,
                        role = %role,
                        error = %e,
                        "Skipping unparseable queue entry"
                    );
                    None
                }
            })
            .filter(QueuedMessage::has_body)
            .collect();
        Ok(messages)
    }

    /// Remove the entry carrying `ack_id` from `role`'s queue.
    ///
    /// Returns whether an entry was removed. A missing entry is not an
    /// error: redelivery means the same ack can arrive twice.
    pub async fn acknowledge(
        &self,
        channel_id: &ChannelId,
        role: ClientType,
        ack_id: &str,
    ) -> StoreResult<bool> {
        let (key, raw) = self.read(channel_id, role).await?;
        tracing::debug!(
            channel_id = %channel_id,
            role = %role,
            pending = raw.len(),
            "Looking up ack"
        );

        let index = raw.iter().position(|entry| {
            if entry.starts_with(PLACEHOLDER_PREFIX) {
                return false;
            }
            match serde_json::from_str::<QueuedMessage>(entry) {
                Ok(msg) => msg.ack_id == ack_id,
                Err(e) => {
                    tracing::error!(channel_id = %channel_id, error = %e, "Error parsing queue entry");
                    false
                }
            }
        });

        let Some(index) = index else {
            RelayMetrics::incr(&self.metrics.acks_unmatched);
            tracing::warn!(
                channel_id = %channel_id,
                role = %role,
                ack_id = %ack_id,
                "Message not found in queue"
            );
            return Ok(false);
        };

        let placeholder = format!(
            "{PLACEHOLDER_PREFIX}{}_{}",
            crate::now_ms(),
            uuid::Uuid::new_v4().simple()
        );
        self.store.lset(&key, index as isize, &placeholder).await?;
        let removed = self.store.lrem(&key, 1, &placeholder).await?;

        RelayMetrics::incr(&self.metrics.acks_removed);
        tracing::info!(
            channel_id = %channel_id,
            role = %role,
            ack_id = %ack_id,
            removed,
            "Message removed from queue"
        );
        Ok(removed > 0)
    }

    /// Read the raw list, moving a legacy queue to the hash-tagged key first.
    ///
    /// Returns the key the entries now live under.
    async fn read(
        &self,
        channel_id: &ChannelId,
        role: ClientType,
    ) -> StoreResult<(String, Vec<String>)> {
        let VersionedKey { primary, legacy } = keys::queue(channel_id, role);

        let current = self.store.lrange(&primary, 0, -1).await?;
        if !current.is_empty() {
            return Ok((primary, current));
        }

        let old = self.store.lrange(&legacy, 0, -1).await?;
        if old.is_empty() {
            return Ok((primary, current));
        }

        // Prepend so entries appended by a concurrent enqueue stay behind them.
        self.store
            .write_batch(vec![
                BatchOp::LPush {
                    key: primary.clone(),
                    values: old.iter().rev().cloned().collect(),
                },
                BatchOp::Expire {
                    key: primary.clone(),
                    secs: self.expiry_secs,
                },
                BatchOp::Del(legacy.clone()),
            ])
            .await?;
        RelayMetrics::incr(&self.metrics.key_migrations);
        tracing::info!(
            channel_id = %channel_id,
            role = %role,
            entries = old.len(),
            from = %legacy,
            to = %primary,
            "Migrated message queue to hash-tagged key"
        );
        let migrated = self.store.lrange(&primary, 0, -1).await?;
        Ok((primary, migrated))
    }
}

/// Indent plaintext JSON for readability; anything else is kept verbatim.
fn pretty_plaintext(raw: &str) -> String {
    serde_json::from_str::<Value>(raw)
        .ok()
        .and_then(|v| serde_json::to_string_pretty(&v).ok())
        .unwrap_or_else(|| raw.to_string())
}
