//! Room membership and broadcast fan-out.
//!
//! Every instance keeps its own sockets and room membership in memory.
//! Broadcasts are delivered to local members directly and published on the
//! store's pub/sub channel `relay#<room>`; every other instance subscribed to
//! `relay#*` delivers them to its own members. An instance ignores its own
//! publications.
//!
//! Join and leave hooks keep the cluster-wide occupancy counter in step with
//! membership. They fire once per socket per room.

use crate::error::StoreResult;
use crate::keys;
use crate::metrics::RelayMetrics;
use crate::occupancy::{LeaveOutcome, OccupancyTracker};
use crate::store::{Store, StoreMessage};
use dashmap::DashMap;
use futures_util::StreamExt;
use relay_types::{ChannelId, ServerEvent, ServerFrame, SocketId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// Cross-instance broadcast envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct RoomEnvelope {
    origin: String,
    room: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    except: Option<String>,
    event: String,
    #[serde(default)]
    args: Vec<Value>,
}

#[derive(Debug)]
struct SocketHandle {
    tx: mpsc::UnboundedSender<ServerFrame>,
    ip: IpAddr,
}

/// Local sockets and rooms, plus fan-out to other instances.
pub struct RoomAdapter {
    instance_id: String,
    store: Arc<dyn Store>,
    occupancy: OccupancyTracker,
    metrics: Arc<RelayMetrics>,
    sockets: DashMap<SocketId, SocketHandle>,
    /// room -> members on this instance
    rooms: DashMap<String, HashSet<SocketId>>,
    /// socket -> rooms it joined
    memberships: DashMap<SocketId, HashSet<ChannelId>>,
}

impl std::fmt::Debug for RoomAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomAdapter")
            .field("instance_id", &self.instance_id)
            .field("sockets", &self.sockets.len())
            .field("rooms", &self.rooms.len())
            .finish_non_exhaustive()
    }
}

impl RoomAdapter {
    /// Create an adapter with a fresh instance id.
    pub fn new(
        store: Arc<dyn Store>,
        occupancy: OccupancyTracker,
        metrics: Arc<RelayMetrics>,
    ) -> Self {
        Self {
            instance_id: uuid::Uuid::new_v4().simple().to_string(),
            store,
            occupancy,
            metrics,
            sockets: DashMap::new(),
            rooms: DashMap::new(),
            memberships: DashMap::new(),
        }
    }

    /// Id stamped on this instance's publications.
    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Register a connected socket. Frames for it arrive on the receiver.
    pub fn register(&self, socket_id: SocketId, ip: IpAddr) -> mpsc::UnboundedReceiver<ServerFrame> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sockets.insert(socket_id, SocketHandle { tx, ip });
        rx
    }

    /// Drop a socket, leaving every room it joined.
    pub async fn unregister(&self, socket_id: &SocketId) {
        let rooms = self
            .memberships
            .remove(socket_id)
            .map(|(_, rooms)| rooms)
            .unwrap_or_default();
        for room in rooms {
            self.remove_member(socket_id, &room);
            self.run_leave_hook(socket_id, &room).await;
        }
        self.sockets.remove(socket_id);
    }

    /// Source address of a connected socket.
    pub fn ip(&self, socket_id: &SocketId) -> Option<IpAddr> {
        self.sockets.get(socket_id).map(|s| s.ip)
    }

    /// Send a frame to one local socket. Returns `false` if it is gone.
    pub fn emit_to(&self, socket_id: &SocketId, frame: ServerFrame) -> bool {
        match self.sockets.get(socket_id) {
            Some(handle) => handle.tx.send(frame).is_ok(),
            None => false,
        }
    }

    /// Whether `socket_id` joined `room` on this instance.
    pub fn is_member(&self, socket_id: &SocketId, room: &ChannelId) -> bool {
        self.rooms
            .get(room.as_str())
            .is_some_and(|members| members.contains(socket_id))
    }

    /// Local member count of `room`.
    pub fn room_size(&self, room: &ChannelId) -> usize {
        self.rooms.get(room.as_str()).map_or(0, |m| m.len())
    }

    /// Local rooms and their sizes, sorted by name.
    pub fn rooms(&self) -> Vec<(String, usize)> {
        let mut rooms: Vec<_> = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();
        rooms.sort();
        rooms
    }

    /// Connected sockets on this instance.
    pub fn socket_count(&self) -> usize {
        self.sockets.len()
    }

    /// Rooms with at least one local member.
    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Add `socket_id` to `room` and run the join hook.
    ///
    /// Returns the cluster occupancy after the join, or `None` if the socket
    /// was already a member (the hook does not fire twice).
    pub async fn join(&self, socket_id: &SocketId, room: &ChannelId) -> StoreResult<Option<i64>> {
        let inserted = self
            .rooms
            .entry(room.as_str().to_string())
            .or_default()
            .insert(socket_id.clone());
        if !inserted {
            return Ok(None);
        }
        self.memberships
            .entry(socket_id.clone())
            .or_default()
            .insert(room.clone());

        let occupancy = match self.occupancy.on_join(room, crate::now_ms()).await {
            Ok(occupancy) => occupancy,
            Err(e) => {
                self.forget_membership(socket_id, room);
                self.remove_member(socket_id, room);
                return Err(e);
            }
        };
        OccupancyTracker::reconcile(room, self.room_size(room), occupancy);
        Ok(Some(occupancy))
    }

    fn forget_membership(&self, socket_id: &SocketId, room: &ChannelId) {
        if let Some(mut rooms) = self.memberships.get_mut(socket_id) {
            rooms.remove(room);
        }
        self.memberships
            .remove_if(socket_id, |_, rooms| rooms.is_empty());
    }

    /// Remove `socket_id` from `room` and run the leave hook.
    ///
    /// Returns `false` if the socket was not a member.
    pub async fn leave(&self, socket_id: &SocketId, room: &ChannelId) -> bool {
        let was_member = self
            .memberships
            .get_mut(socket_id)
            .is_some_and(|mut rooms| rooms.remove(room));
        if !was_member {
            return false;
        }
        self.remove_member(socket_id, room);
        self.run_leave_hook(socket_id, room).await;
        true
    }

    fn remove_member(&self, socket_id: &SocketId, room: &ChannelId) {
        if let Some(mut members) = self.rooms.get_mut(room.as_str()) {
            members.remove(socket_id);
        }
        self.rooms
            .remove_if(room.as_str(), |_, members| members.is_empty());
    }

    async fn run_leave_hook(&self, socket_id: &SocketId, room: &ChannelId) {
        match self.occupancy.on_leave(room, crate::now_ms()).await {
            Ok(LeaveOutcome::Closed) => {
                tracing::info!(channel_id = %room, socket_id = %socket_id, "Room closed");
            }
            Ok(LeaveOutcome::Remaining(occupancy)) => {
                tracing::info!(
                    channel_id = %room,
                    socket_id = %socket_id,
                    occupancy,
                    "Peer left room"
                );
                let frame =
                    ServerFrame::bare_event(ServerEvent::ClientsDisconnected.for_channel(room.as_str()));
                self.broadcast(room, None, frame).await;
            }
            Err(e) => {
                RelayMetrics::incr(&self.metrics.store_errors);
                tracing::error!(
                    channel_id = %room,
                    socket_id = %socket_id,
                    error = %e,
                    "Occupancy update on leave failed"
                );
            }
        }
    }

    /// Deliver an event to every member of `room` cluster-wide, except
    /// `except`.
    pub async fn broadcast(&self, room: &ChannelId, except: Option<&SocketId>, frame: ServerFrame) {
        let ServerFrame::Event { event, args } = frame else {
            tracing::warn!(channel_id = %room, "Only events can be broadcast");
            return;
        };

        self.deliver_local(room.as_str(), except.map(SocketId::as_str), &event, &args);

        let envelope = RoomEnvelope {
            origin: self.instance_id.clone(),
            room: room.as_str().to_string(),
            except: except.map(|s| s.as_str().to_string()),
            event,
            args,
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(p) => p,
            Err(e) => {
                tracing::error!("Failed to serialize room broadcast: {}", e);
                return;
            }
        };
        match self
            .store
            .publish(&keys::room_events(room.as_str()), &payload)
            .await
        {
            Ok(()) => RelayMetrics::incr(&self.metrics.broadcasts_published),
            Err(e) => {
                RelayMetrics::incr(&self.metrics.store_errors);
                tracing::error!(channel_id = %room, error = %e, "Failed to publish room broadcast");
            }
        }
    }

    fn deliver_local(&self, room: &str, except: Option<&str>, event: &str, args: &[Value]) -> usize {
        let Some(members) = self.rooms.get(room) else {
            return 0;
        };
        let targets: Vec<SocketId> = members
            .iter()
            .filter(|id| Some(id.as_str()) != except)
            .cloned()
            .collect();
        drop(members);

        targets
            .iter()
            .filter(|id| {
                self.emit_to(
                    id,
                    ServerFrame::Event {
                        event: event.to_string(),
                        args: args.to_vec(),
                    },
                )
            })
            .count()
    }

    fn handle_remote(&self, message: StoreMessage) {
        let envelope: RoomEnvelope = match serde_json::from_str(&message.payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(channel = %message.channel, error = %e, "Ignoring malformed room broadcast");
                return;
            }
        };
        if envelope.origin == self.instance_id {
            return;
        }
        RelayMetrics::incr(&self.metrics.broadcasts_received);
        let delivered = self.deliver_local(
            &envelope.room,
            envelope.except.as_deref(),
            &envelope.event,
            &envelope.args,
        );
        tracing::trace!(room = %envelope.room, event = %envelope.event, delivered, "Remote broadcast");
    }

    /// Subscribe to room broadcasts from other instances.
    ///
    /// The subscription is established before this returns. If it is lost
    /// the task resubscribes until aborted.
    pub async fn start_subscriber(self: &Arc<Self>) -> StoreResult<tokio::task::JoinHandle<()>> {
        let pattern = keys::room_events_pattern();
        let mut stream = self.store.subscribe(&pattern).await?;
        tracing::info!(pattern = %pattern, instance = %self.instance_id, "Subscribed to room broadcasts");

        let adapter = Arc::clone(self);
        Ok(tokio::spawn(async move {
            loop {
                while let Some(message) = stream.next().await {
                    adapter.handle_remote(message);
                }
                tracing::warn!("Room broadcast subscription lost, resubscribing");
                loop {
                    tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                    match adapter.store.subscribe(&pattern).await {
                        Ok(s) => {
                            stream = s;
                            break;
                        }
                        Err(e) => tracing::error!(error = %e, "Resubscribe failed"),
                    }
                }
            }
        }))
    }

    /// Leave every room and close every local socket's outbound channel.
    pub async fn close_all(&self) {
        let sockets: Vec<SocketId> = self.sockets.iter().map(|e| e.key().clone()).collect();
        let count = sockets.len();
        for socket_id in sockets {
            self.unregister(&socket_id).await;
        }
        self.sockets.clear();
        tracing::info!(sockets = count, "Closed local sockets");
    }
}
