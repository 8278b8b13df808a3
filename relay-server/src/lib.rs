//! # rendezvous-relay
//!
//! Rendezvous relay pairing a dapp with a wallet over an end-to-end-encrypted
//! channel.
//!
//! This crate implements a relay server that:
//! - Accepts WebSocket connections and assigns them to two-party rooms
//! - Relays opaque payloads between the dapp and the wallet of a channel
//! - Queues undelivered messages per recipient until they are acknowledged
//! - Shares all channel state through a clustered store, so any number of
//!   stateless instances can serve the same channels
//! - Never reads message contents (the relay is a "dumb pipe")
//!
//! ## Architecture
//!
//! ```text
//!   Dapp ──┐                                  ┌── Wallet
//!          │ WebSocket                        │ WebSocket
//!      ┌───┴──────────┐              ┌────────┴─────┐
//!      │  relay (A)   │◄── pub/sub ──►│  relay (B)   │
//!      └───┬──────────┘              └────────┬─────┘
//!          │      ┌──────────────────────┐    │
//!          └─────►│ store (configs,      │◄───┘
//!                 │ queues, occupancy)   │
//!                 └──────────────────────┘
//! ```
//!
//! ## Protocol
//!
//! Clients send `create_channel`, `join_channel`, `message`, `ack`, `ping`,
//! `rejected`, `leave_channel` and `check_room`. The server answers callbacks
//! and emits `<event>-<channelId>` events to room members.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod adapter;
pub mod cleanup;
pub mod config;
pub mod error;
pub mod http;
pub mod keys;
pub mod limits;
pub mod metrics;
pub mod occupancy;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
