//! Channel configuration records.
//!
//! Reads go through [`ChannelRegistry::get`], which falls back to the
//! untagged legacy key and copies a legacy hit forward. Writes always target
//! the hash-tagged key and refresh its TTL.

use crate::config::ChannelsConfig;
use crate::error::StoreResult;
use crate::keys;
use crate::metrics::RelayMetrics;
use crate::store::Store;
use relay_types::{ChannelConfig, ChannelId, ClientType, SocketId};
use std::sync::Arc;

/// Result of a join against the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    /// Config updated (or still absent for a role that cannot create one).
    Joined {
        /// Config after the join, if one exists.
        config: Option<ChannelConfig>,
        /// The wallet key was recorded by this join.
        wallet_key_added: bool,
    },
    /// The wallet declined this channel; nothing was written.
    Rejected(ChannelConfig),
}

/// Result of a rejection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectOutcome {
    /// Rejection stored with the short TTL.
    Recorded(ChannelConfig),
    /// Key exchange already completed; nothing was written.
    AlreadyReady(ChannelConfig),
}

/// CRUD over per-channel config records.
#[derive(Clone)]
pub struct ChannelRegistry {
    store: Arc<dyn Store>,
    metrics: Arc<RelayMetrics>,
    expiry_secs: u64,
    rejected_expiry_secs: u64,
}

impl std::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelRegistry")
            .field("expiry_secs", &self.expiry_secs)
            .field("rejected_expiry_secs", &self.rejected_expiry_secs)
            .finish_non_exhaustive()
    }
}

impl ChannelRegistry {
    /// Create a registry over `store`.
    pub fn new(store: Arc<dyn Store>, metrics: Arc<RelayMetrics>, config: &ChannelsConfig) -> Self {
        Self {
            store,
            metrics,
            expiry_secs: config.expiry_secs,
            rejected_expiry_secs: config.rejected_expiry_secs,
        }
    }

    /// Read a channel config, migrating a legacy record forward.
    pub async fn get(&self, channel_id: &ChannelId) -> StoreResult<Option<ChannelConfig>> {
        let key = keys::config(channel_id);

        if let Some(raw) = self.store.get(&key.primary).await? {
            RelayMetrics::incr(&self.metrics.config_reads_hit);
            return Ok(Some(serde_json::from_str(&raw)?));
        }

        let Some(raw) = self.store.get(&key.legacy).await? else {
            RelayMetrics::incr(&self.metrics.config_reads_miss);
            return Ok(None);
        };

        let config: ChannelConfig = serde_json::from_str(&raw)?;
        self.store.set_ex(&key.primary, &raw, self.expiry_secs).await?;
        RelayMetrics::incr(&self.metrics.key_migrations);
        RelayMetrics::incr(&self.metrics.config_reads_hit);
        tracing::info!(
            channel_id = %channel_id,
            from = %key.legacy,
            to = %key.primary,
            "Migrated channel config to hash-tagged key"
        );
        Ok(Some(config))
    }

    /// Write a config with the regular channel TTL.
    pub async fn save(&self, channel_id: &ChannelId, config: &ChannelConfig) -> StoreResult<()> {
        self.write(channel_id, config, self.expiry_secs).await
    }

    async fn write(&self, channel_id: &ChannelId, config: &ChannelConfig, secs: u64) -> StoreResult<()> {
        let raw = serde_json::to_string(config)?;
        self.store
            .set_ex(&keys::config(channel_id).primary, &raw, secs)
            .await
    }

    /// Record `socket_id` as the current connection for `role`.
    ///
    /// Only a dapp creates a missing config. Without a role the config is
    /// read but never written. A wallet join may carry its public key, which
    /// is recorded once.
    pub async fn get_or_create(
        &self,
        channel_id: &ChannelId,
        role: Option<ClientType>,
        socket_id: &SocketId,
        public_key: Option<&str>,
        now_ms: i64,
    ) -> StoreResult<JoinOutcome> {
        let existing = self.get(channel_id).await?;

        let Some(role) = role else {
            return Ok(match existing {
                Some(config) if config.rejected => JoinOutcome::Rejected(config),
                config => JoinOutcome::Joined {
                    config,
                    wallet_key_added: false,
                },
            });
        };

        let mut config = match existing {
            Some(config) if config.rejected => {
                tracing::info!(channel_id = %channel_id, socket_id = %socket_id, "Join on rejected channel");
                return Ok(JoinOutcome::Rejected(config));
            }
            Some(mut config) => {
                config.set_client(role, socket_id.as_str(), now_ms);
                config
            }
            None if role == ClientType::Dapp => {
                tracing::debug!(channel_id = %channel_id, socket_id = %socket_id, "Creating channel config");
                ChannelConfig::new(role, socket_id.as_str(), now_ms)
            }
            None => {
                return Ok(JoinOutcome::Joined {
                    config: None,
                    wallet_key_added: false,
                })
            }
        };

        let mut wallet_key_added = false;
        if role == ClientType::Wallet && config.wallet_key.is_none() {
            if let Some(key) = public_key.filter(|k| !k.is_empty()) {
                config.wallet_key = Some(key.to_string());
                wallet_key_added = true;
            }
        }

        self.save(channel_id, &config).await?;
        Ok(JoinOutcome::Joined {
            config: Some(config),
            wallet_key_added,
        })
    }

    /// Mark the key exchange complete and refresh the TTL.
    ///
    /// Returns `None` when no config exists (older clients without a role).
    pub async fn mark_ready(
        &self,
        channel_id: &ChannelId,
        now_ms: i64,
    ) -> StoreResult<Option<ChannelConfig>> {
        let Some(mut config) = self.get(channel_id).await? else {
            return Ok(None);
        };
        config.ready = true;
        config.updated_at = now_ms;
        self.save(channel_id, &config).await?;
        tracing::info!(channel_id = %channel_id, persistence = config.persistence, "Channel ready");
        Ok(Some(config))
    }

    /// Record a wallet rejection with the short TTL.
    pub async fn mark_rejected(
        &self,
        channel_id: &ChannelId,
        socket_id: &SocketId,
        now_ms: i64,
    ) -> StoreResult<RejectOutcome> {
        let config = match self.get(channel_id).await? {
            Some(config) if config.ready => {
                tracing::warn!(
                    channel_id = %channel_id,
                    socket_id = %socket_id,
                    "Rejection after key exchange ignored"
                );
                return Ok(RejectOutcome::AlreadyReady(config));
            }
            Some(mut config) => {
                config.rejected = true;
                config.updated_at = now_ms;
                config
            }
            // Peer joined through another instance, or the config already expired.
            None => ChannelConfig::rejected_by_wallet(socket_id.as_str(), now_ms),
        };

        self.write(channel_id, &config, self.rejected_expiry_secs).await?;
        tracing::info!(channel_id = %channel_id, socket_id = %socket_id, "Channel rejected");
        Ok(RejectOutcome::Recorded(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn registry() -> (ChannelRegistry, MemoryStore, Arc<RelayMetrics>) {
        let store = MemoryStore::new();
        let metrics = Arc::new(RelayMetrics::default());
        let registry = ChannelRegistry::new(
            Arc::new(store.clone()),
            metrics.clone(),
            &ChannelsConfig::default(),
        );
        (registry, store, metrics)
    }

    fn joined(outcome: JoinOutcome) -> (Option<ChannelConfig>, bool) {
        match outcome {
            JoinOutcome::Joined {
                config,
                wallet_key_added,
            } => (config, wallet_key_added),
            JoinOutcome::Rejected(_) => panic!("unexpected rejection"),
        }
    }

    #[tokio::test]
    async fn dapp_creates_config() {
        let (registry, store, _) = registry();
        let channel = ChannelId::random();
        let socket = SocketId::new();

        let (config, _) = joined(
            registry
                .get_or_create(&channel, Some(ClientType::Dapp), &socket, None, 10)
                .await
                .unwrap(),
        );
        let config = config.unwrap();
        assert_eq!(config.client(ClientType::Dapp), Some(socket.as_str()));
        assert!(!config.persistence);
        assert!(store.contains(&keys::config(&channel).primary));
    }

    #[tokio::test]
    async fn wallet_does_not_create_config() {
        let (registry, store, _) = registry();
        let channel = ChannelId::random();

        let (config, _) = joined(
            registry
                .get_or_create(&channel, Some(ClientType::Wallet), &SocketId::new(), None, 10)
                .await
                .unwrap(),
        );
        assert!(config.is_none());
        assert!(!store.contains(&keys::config(&channel).primary));
    }

    #[tokio::test]
    async fn join_without_role_is_read_only() {
        let (registry, store, _) = registry();
        let channel = ChannelId::random();
        let (config, _) = joined(
            registry
                .get_or_create(&channel, None, &SocketId::new(), None, 10)
                .await
                .unwrap(),
        );
        assert!(config.is_none());
        assert!(store.keys("*").is_empty());
    }

    #[tokio::test]
    async fn both_roles_enable_persistence() {
        let (registry, _, _) = registry();
        let channel = ChannelId::random();
        registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 10)
            .await
            .unwrap();
        let (config, _) = joined(
            registry
                .get_or_create(&channel, Some(ClientType::Wallet), &SocketId::new(), None, 20)
                .await
                .unwrap(),
        );
        let config = config.unwrap();
        assert!(config.persistence);
        assert_eq!(config.updated_at, 20);
        assert_eq!(config.created_at, 10);
    }

    #[tokio::test]
    async fn wallet_key_recorded_once() {
        let (registry, _, _) = registry();
        let channel = ChannelId::random();
        registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 1)
            .await
            .unwrap();

        let (config, added) = joined(
            registry
                .get_or_create(&channel, Some(ClientType::Wallet), &SocketId::new(), Some("04aa"), 2)
                .await
                .unwrap(),
        );
        assert!(added);
        assert_eq!(config.unwrap().wallet_key.as_deref(), Some("04aa"));

        let (config, added) = joined(
            registry
                .get_or_create(&channel, Some(ClientType::Wallet), &SocketId::new(), Some("04bb"), 3)
                .await
                .unwrap(),
        );
        assert!(!added);
        assert_eq!(config.unwrap().wallet_key.as_deref(), Some("04aa"));
    }

    #[tokio::test]
    async fn legacy_config_is_migrated() {
        let (registry, store, metrics) = registry();
        let channel = ChannelId::random();
        let key = keys::config(&channel);
        let legacy = ChannelConfig::new(ClientType::Dapp, "old-socket", 5);
        store
            .set(&key.legacy, &serde_json::to_string(&legacy).unwrap())
            .await
            .unwrap();

        let found = registry.get(&channel).await.unwrap();
        assert_eq!(found, Some(legacy.clone()));
        assert!(store.contains(&key.primary));
        assert_eq!(metrics.key_migrations.load(Ordering::Relaxed), 1);

        // Second read is served by the primary key.
        registry.get(&channel).await.unwrap();
        assert_eq!(metrics.key_migrations.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn missing_config_counts_miss() {
        let (registry, _, metrics) = registry();
        assert!(registry.get(&ChannelId::random()).await.unwrap().is_none());
        assert_eq!(metrics.config_reads_miss.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn mark_ready_sets_flag() {
        let (registry, _, _) = registry();
        let channel = ChannelId::random();
        assert!(registry.mark_ready(&channel, 1).await.unwrap().is_none());

        registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 1)
            .await
            .unwrap();
        let config = registry.mark_ready(&channel, 2).await.unwrap().unwrap();
        assert!(config.ready);
        assert!(registry.get(&channel).await.unwrap().unwrap().ready);
    }

    #[tokio::test]
    async fn reject_without_config_synthesizes_record() {
        let (registry, store, _) = registry();
        let channel = ChannelId::random();
        let wallet = SocketId::new();

        let outcome = registry.mark_rejected(&channel, &wallet, 7).await.unwrap();
        let RejectOutcome::Recorded(config) = outcome else {
            panic!("expected rejection to be recorded");
        };
        assert!(config.rejected);
        assert_eq!(config.client(ClientType::Wallet), Some(wallet.as_str()));

        let ttl = store.ttl(&keys::config(&channel).primary).unwrap();
        assert!(ttl <= Duration::from_secs(300));
    }

    #[tokio::test]
    async fn reject_after_ready_is_ignored() {
        let (registry, _, _) = registry();
        let channel = ChannelId::random();
        registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 1)
            .await
            .unwrap();
        registry.mark_ready(&channel, 2).await.unwrap();

        let outcome = registry
            .mark_rejected(&channel, &SocketId::new(), 3)
            .await
            .unwrap();
        assert!(matches!(outcome, RejectOutcome::AlreadyReady(_)));
        assert!(!registry.get(&channel).await.unwrap().unwrap().rejected);
    }

    #[tokio::test]
    async fn join_on_rejected_channel_is_refused() {
        let (registry, _, _) = registry();
        let channel = ChannelId::random();
        registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 1)
            .await
            .unwrap();
        registry
            .mark_rejected(&channel, &SocketId::new(), 2)
            .await
            .unwrap();

        let outcome = registry
            .get_or_create(&channel, Some(ClientType::Dapp), &SocketId::new(), None, 3)
            .await
            .unwrap();
        assert!(matches!(outcome, JoinOutcome::Rejected(_)));
    }
}
