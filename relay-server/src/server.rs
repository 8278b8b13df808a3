//! Main relay coordination.
//!
//! [`Relay`] owns the shared store handle and every component built on it.
//! It is constructed once at startup and shared as `Arc<Relay>` by the HTTP
//! routes, the WebSocket sessions and the background tasks.

use crate::adapter::RoomAdapter;
use crate::cleanup::spawn_limits_maintenance;
use crate::config::Config;
use crate::error::StoreResult;
use crate::limits::RateLimits;
use crate::metrics::RelayMetrics;
use crate::occupancy::OccupancyTracker;
use crate::queue::MessageQueue;
use crate::registry::ChannelRegistry;
use crate::store::health::{spawn_health_monitor, StoreHealth};
use crate::store::Store;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Main relay server.
pub struct Relay {
    config: Config,
    store: Arc<dyn Store>,
    registry: ChannelRegistry,
    queue: MessageQueue,
    occupancy: OccupancyTracker,
    /// Per-IP limiters for joins and messages.
    rate_limits: RateLimits,
    /// Operational metrics (counters, histograms).
    metrics: Arc<RelayMetrics>,
    /// Local rooms and cross-instance fan-out.
    adapter: Arc<RoomAdapter>,
    health: Arc<StoreHealth>,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("config", &self.config)
            .field("backend", &self.store.backend())
            .field("rate_limits", &self.rate_limits)
            .field("adapter", &self.adapter)
            .finish_non_exhaustive()
    }
}

/// Handles of the relay's background tasks.
#[derive(Debug)]
pub struct BackgroundTasks {
    handles: Vec<JoinHandle<()>>,
}

impl BackgroundTasks {
    /// Abort every task.
    pub fn abort(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

impl Relay {
    /// Create a relay over an already connected store.
    pub fn new(config: Config, store: Arc<dyn Store>) -> Self {
        let metrics = Arc::new(RelayMetrics::default());
        let occupancy = OccupancyTracker::new(store.clone(), config.channels.occupancy_ttl_secs);
        let registry = ChannelRegistry::new(store.clone(), metrics.clone(), &config.channels);
        let queue = MessageQueue::new(
            store.clone(),
            metrics.clone(),
            config.channels.message_expiry_secs,
            config.server.development,
        );
        let adapter = Arc::new(RoomAdapter::new(
            store.clone(),
            occupancy.clone(),
            metrics.clone(),
        ));
        let rate_limits = RateLimits::new(&config.limits);

        Self {
            config,
            store,
            registry,
            queue,
            occupancy,
            rate_limits,
            metrics,
            adapter,
            health: Arc::new(StoreHealth::new()),
        }
    }

    /// Subscribe to cross-instance broadcasts and start the periodic tasks.
    pub async fn start(self: &Arc<Self>) -> StoreResult<BackgroundTasks> {
        let subscriber = self.adapter.start_subscriber().await?;
        let health = spawn_health_monitor(
            self.store.clone(),
            self.health.clone(),
            Duration::from_secs(self.config.store.health_interval_secs),
            self.config.store.health_failure_threshold,
        );
        let maintenance = spawn_limits_maintenance(self.clone());
        Ok(BackgroundTasks {
            handles: vec![subscriber, health, maintenance],
        })
    }

    /// Get the relay configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the shared store.
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Channel config records.
    pub fn registry(&self) -> &ChannelRegistry {
        &self.registry
    }

    /// Pending message queues.
    pub fn queue(&self) -> &MessageQueue {
        &self.queue
    }

    /// Cluster-wide occupancy counters.
    pub fn occupancy(&self) -> &OccupancyTracker {
        &self.occupancy
    }

    /// Get access to the rate limiters.
    pub fn rate_limits(&self) -> &RateLimits {
        &self.rate_limits
    }

    /// Get access to the operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.metrics
    }

    /// Local rooms and sockets.
    pub fn adapter(&self) -> &Arc<RoomAdapter> {
        &self.adapter
    }

    /// Result of the store liveness probe.
    pub fn store_health(&self) -> &StoreHealth {
        &self.health
    }

    /// Connected sockets on this instance.
    pub fn total_sessions(&self) -> usize {
        self.adapter.socket_count()
    }

    /// Rooms with a local member.
    pub fn total_rooms(&self) -> usize {
        self.adapter.room_count()
    }

    /// Drop every session and close the store.
    pub async fn shutdown(&self) {
        self.adapter.close_all().await;
        self.store.close().await;
        tracing::info!("Relay shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use relay_types::{ChannelId, SocketId};
    use std::net::{IpAddr, Ipv4Addr};

    fn test_relay() -> Arc<Relay> {
        Arc::new(Relay::new(Config::default(), Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn sessions_and_rooms_are_counted() {
        let relay = test_relay();
        let socket = SocketId::new();
        let _rx = relay
            .adapter()
            .register(socket.clone(), IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(relay.total_sessions(), 1);

        relay
            .adapter()
            .join(&socket, &ChannelId::random())
            .await
            .unwrap();
        assert_eq!(relay.total_rooms(), 1);

        relay.adapter().unregister(&socket).await;
        assert_eq!(relay.total_sessions(), 0);
        assert_eq!(relay.total_rooms(), 0);
    }

    #[tokio::test]
    async fn start_and_stop_background_tasks() {
        let relay = test_relay();
        let tasks = relay.start().await.unwrap();
        assert_eq!(tasks.handles.len(), 3);
        tasks.abort();
        relay.shutdown().await;
        assert_eq!(relay.total_sessions(), 0);
    }

    #[test]
    fn relay_is_debug() {
        let relay = test_relay();
        let debug = format!("{:?}", relay);
        assert!(debug.contains("memory"));
    }
}
