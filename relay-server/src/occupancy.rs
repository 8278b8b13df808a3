//! Cluster-wide room occupancy.
//!
//! Each relay instance only sees its own sockets. The occupancy hash in the
//! shared store counts joins across all instances so a dapp and a wallet on
//! different instances still agree on whether the room is full. The counter
//! is driven by the room adapter's join/leave hooks, which fire once per
//! connection per room.

use crate::error::StoreResult;
use crate::keys;
use crate::store::Store;
use relay_types::{ChannelId, OccupancyRecord};
use std::sync::Arc;

const OCCUPANCY_FIELD: &str = "occupancy";
const TIMESTAMP_FIELD: &str = "timestamp";

/// Maximum number of connections in a channel room.
pub const MAX_CLIENTS_PER_ROOM: i64 = 2;

/// Result of a room-leave hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// The counter reached zero and was deleted.
    Closed,
    /// Connections still in the room cluster-wide.
    Remaining(i64),
}

/// Comparison of this instance's room size with the cluster counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciliation {
    /// Both views agree.
    Consistent,
    /// Cluster count exceeds local count by one: the peer is on another instance.
    PeerElsewhere,
    /// Negative counter or a gap larger than one.
    Invalid,
}

/// Tracks cluster-wide occupancy per channel.
#[derive(Clone)]
pub struct OccupancyTracker {
    store: Arc<dyn Store>,
    ttl_secs: u64,
}

impl std::fmt::Debug for OccupancyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OccupancyTracker")
            .field("ttl_secs", &self.ttl_secs)
            .finish_non_exhaustive()
    }
}

impl OccupancyTracker {
    /// Create a tracker. `ttl_secs` bounds how long a counter outlives the
    /// last join if an instance dies without running its leave hooks.
    pub fn new(store: Arc<dyn Store>, ttl_secs: u64) -> Self {
        Self { store, ttl_secs }
    }

    /// Room-join hook. Returns the new cluster occupancy.
    pub async fn on_join(&self, channel_id: &ChannelId, now_ms: i64) -> StoreResult<i64> {
        let key = keys::occupancy(channel_id);
        let occupancy = self.store.hincr_by(&key, OCCUPANCY_FIELD, 1).await?;
        if let Err(e) = self.stamp(&key, now_ms).await {
            // The caller rolls the membership back, so the count must go too.
            if let Err(undo) = self.store.hincr_by(&key, OCCUPANCY_FIELD, -1).await {
                tracing::error!(channel_id = %channel_id, error = %undo, "Failed to undo occupancy increment");
            }
            return Err(e);
        }
        tracing::debug!(channel_id = %channel_id, occupancy, "Room joined");
        Ok(occupancy)
    }

    async fn stamp(&self, key: &str, now_ms: i64) -> StoreResult<()> {
        self.store
            .hset(key, TIMESTAMP_FIELD, &now_ms.to_string())
            .await?;
        self.store.expire(key, self.ttl_secs).await?;
        Ok(())
    }

    /// Room-leave hook. Deletes the counter once the room is empty.
    pub async fn on_leave(&self, channel_id: &ChannelId, now_ms: i64) -> StoreResult<LeaveOutcome> {
        let key = keys::occupancy(channel_id);
        let occupancy = self.store.hincr_by(&key, OCCUPANCY_FIELD, -1).await?;
        if occupancy <= 0 {
            self.store.del(&key).await?;
            tracing::debug!(channel_id = %channel_id, "Room closed");
            return Ok(LeaveOutcome::Closed);
        }
        self.stamp(&key, now_ms).await?;
        tracing::debug!(channel_id = %channel_id, occupancy, "Room kept alive");
        Ok(LeaveOutcome::Remaining(occupancy))
    }

    /// Refresh the counter TTL for a room with a live member.
    pub async fn touch(&self, channel_id: &ChannelId) -> StoreResult<()> {
        self.store
            .expire(&keys::occupancy(channel_id), self.ttl_secs)
            .await
            .map(|_| ())
    }

    /// Current cluster-wide record (zero when absent).
    pub async fn get(&self, channel_id: &ChannelId) -> StoreResult<OccupancyRecord> {
        let key = keys::occupancy(channel_id);
        let occupancy = self.store.hget(&key, OCCUPANCY_FIELD).await?;
        let timestamp = self.store.hget(&key, TIMESTAMP_FIELD).await?;
        Ok(OccupancyRecord {
            occupancy: occupancy.and_then(|v| v.parse().ok()).unwrap_or(0),
            timestamp: timestamp.and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    /// Compare local room size with the cluster counter and log divergence.
    ///
    /// Divergence is only reported; the counter converges through the
    /// join/leave hooks.
    pub fn reconcile(channel_id: &ChannelId, local: usize, cluster: i64) -> Reconciliation {
        let gap = cluster - local as i64;
        if cluster < 0 || gap > 1 {
            tracing::warn!(
                channel_id = %channel_id,
                local,
                cluster,
                "INVALID room occupancy"
            );
            Reconciliation::Invalid
        } else if gap == 1 {
            tracing::warn!(
                channel_id = %channel_id,
                local,
                cluster,
                "Room occupancy differs by one, peer likely on another instance"
            );
            Reconciliation::PeerElsewhere
        } else {
            Reconciliation::Consistent
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn tracker() -> (OccupancyTracker, MemoryStore) {
        let store = MemoryStore::new();
        (OccupancyTracker::new(Arc::new(store.clone()), 3600), store)
    }

    #[tokio::test]
    async fn two_joins_then_two_leaves() {
        let (tracker, store) = tracker();
        let channel = ChannelId::random();

        assert_eq!(tracker.on_join(&channel, 1).await.unwrap(), 1);
        assert_eq!(tracker.on_join(&channel, 2).await.unwrap(), 2);
        assert_eq!(tracker.get(&channel).await.unwrap().occupancy, 2);

        assert_eq!(
            tracker.on_leave(&channel, 3).await.unwrap(),
            LeaveOutcome::Remaining(1)
        );
        let record = tracker.get(&channel).await.unwrap();
        assert_eq!(record.occupancy, 1);
        assert_eq!(record.timestamp, 3);

        assert_eq!(
            tracker.on_leave(&channel, 4).await.unwrap(),
            LeaveOutcome::Closed
        );
        assert!(!store.contains(&keys::occupancy(&channel)));
        assert_eq!(tracker.get(&channel).await.unwrap().occupancy, 0);
    }

    #[tokio::test]
    async fn leave_without_join_closes() {
        let (tracker, store) = tracker();
        let channel = ChannelId::random();
        assert_eq!(
            tracker.on_leave(&channel, 1).await.unwrap(),
            LeaveOutcome::Closed
        );
        assert!(!store.contains(&keys::occupancy(&channel)));
    }

    #[tokio::test]
    async fn join_sets_ttl() {
        let (tracker, store) = tracker();
        let channel = ChannelId::random();
        tracker.on_join(&channel, 1).await.unwrap();
        assert!(store.ttl(&keys::occupancy(&channel)).is_some());
    }

    #[tokio::test]
    async fn counter_of_a_dead_instance_expires() {
        let store = MemoryStore::new();
        let tracker = OccupancyTracker::new(Arc::new(store.clone()), 1);
        let channel = ChannelId::random();
        tracker.on_join(&channel, 1).await.unwrap();
        tracker.on_join(&channel, 2).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        assert_eq!(tracker.get(&channel).await.unwrap().occupancy, 0);
    }

    #[tokio::test]
    async fn touch_and_leave_refresh_ttl() {
        let (tracker, store) = tracker();
        let channel = ChannelId::random();
        let key = keys::occupancy(&channel);
        tracker.on_join(&channel, 1).await.unwrap();
        tracker.on_join(&channel, 2).await.unwrap();

        store.expire(&key, 5).await.unwrap();
        tracker.touch(&channel).await.unwrap();
        assert!(store.ttl(&key).unwrap() > std::time::Duration::from_secs(5));

        store.expire(&key, 5).await.unwrap();
        tracker.on_leave(&channel, 3).await.unwrap();
        assert!(store.ttl(&key).unwrap() > std::time::Duration::from_secs(5));
    }

    #[test]
    fn reconcile_classifies_gaps() {
        let channel = ChannelId::random();
        assert_eq!(
            OccupancyTracker::reconcile(&channel, 2, 2),
            Reconciliation::Consistent
        );
        assert_eq!(
            OccupancyTracker::reconcile(&channel, 1, 2),
            Reconciliation::PeerElsewhere
        );
        assert_eq!(
            OccupancyTracker::reconcile(&channel, 0, 2),
            Reconciliation::Invalid
        );
        assert_eq!(
            OccupancyTracker::reconcile(&channel, 1, -1),
            Reconciliation::Invalid
        );
    }
}
