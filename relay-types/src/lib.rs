//! # relay-types
//!
//! Wire format types for the rendezvous relay protocol.
//!
//! This crate provides the types shared by the relay server and its clients:
//! - [`ChannelId`], [`SocketId`], [`ClientType`] - Identity types
//! - [`ChannelConfig`], [`QueuedMessage`], [`OccupancyRecord`] - Stored records
//! - [`ClientFrame`], [`ServerFrame`] - WebSocket framing
//! - [`Request`] - Normalized protocol requests
//! - [`TypesError`] - Error types

#![warn(missing_docs)]
#![warn(clippy::all)]

mod channel;
mod error;
mod ids;
mod messages;

pub use channel::{ChannelConfig, OccupancyRecord, QueuedMessage};
pub use error::TypesError;
pub use ids::{ChannelId, ClientType, SocketId};
pub use messages::{
    AckRequest, ClientFrame, JoinRequest, MessagePayload, MessageRequest, PingRequest,
    RejectRequest, Request, ServerEvent, ServerFrame, KEY_HANDSHAKE_ACK,
};
