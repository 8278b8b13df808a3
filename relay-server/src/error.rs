//! Error types for the relay server.

use std::time::Duration;

/// Main error type for relay operations.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Shared store error.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// Protocol error.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Rate limit exceeded.
    #[error("rate limit exceeded: {0}")]
    RateLimited(#[from] RateLimitError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Shared store errors.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Error reported by the store driver.
    #[error("driver error: {0}")]
    Driver(#[from] redis::RedisError),

    /// No connection became available within the acquire timeout.
    #[error("connection pool exhausted after {0:?}")]
    PoolExhausted(Duration),

    /// The pool has been closed during shutdown.
    #[error("connection pool closed")]
    PoolClosed,

    /// A key holds a value of a different type than the command expects.
    #[error("wrong value type at key {key}")]
    WrongType {
        /// The offending key.
        key: String,
    },

    /// List index outside the list.
    #[error("index {index} out of range for {key}")]
    IndexOutOfRange {
        /// The list key.
        key: String,
        /// The requested index.
        index: isize,
    },

    /// A stored record could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store nodes are missing or unusable.
    #[error("invalid store configuration: {0}")]
    InvalidConfig(String),
}

/// Protocol layer errors.
///
/// The `Display` text of each variant is what the client receives in its
/// callback, so keep it short and stable.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Channel id missing or not a UUID.
    #[error("error_id")]
    InvalidChannelId,

    /// Event arguments do not match the expected shape.
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Socket sent an event for a room it has not joined.
    #[error("not in room")]
    NotInRoom,

    /// Both roles are already present in the room.
    #[error("room already full")]
    RoomFull,

    /// Malformed frame or unknown event.
    #[error(transparent)]
    Frame(#[from] relay_types::TypesError),
}

/// Rate limit error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many join attempts from this address.
    #[error("join rate limit exceeded")]
    JoinLimitExceeded,
    /// Too many messages from this address.
    #[error("message rate limit exceeded")]
    MessageLimitExceeded,
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Result type alias for store operations.
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Result type alias for protocol operations.
pub type ProtocolResult<T> = std::result::Result<T, ProtocolError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_text_is_client_facing() {
        assert_eq!(ProtocolError::InvalidChannelId.to_string(), "error_id");
        assert_eq!(ProtocolError::RoomFull.to_string(), "room already full");
    }

    #[test]
    fn relay_error_wraps_layers() {
        let err: RelayError = StoreError::PoolExhausted(Duration::from_secs(15)).into();
        assert!(err.to_string().contains("pool exhausted"));

        let err: RelayError = RateLimitError::JoinLimitExceeded.into();
        assert_eq!(
            err.to_string(),
            "rate limit exceeded: join rate limit exceeded"
        );
    }
}
