//! Error types for the relay wire format.

use thiserror::Error;

/// Errors produced while parsing identifiers or protocol frames.
#[derive(Debug, Error)]
pub enum TypesError {
    /// Channel id is not a hyphenated UUID
    #[error("invalid channel id: {0:?}")]
    InvalidChannelId(String),

    /// Frame is not valid JSON or lacks the event name
    #[error("malformed frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    /// Event arguments do not match the expected shape
    #[error("invalid arguments for {event}: {reason}")]
    InvalidArguments {
        /// Event name
        event: String,
        /// What was wrong
        reason: String,
    },

    /// Event name is not part of the protocol
    #[error("unknown event: {0}")]
    UnknownEvent(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = TypesError::InvalidChannelId("nope".to_string());
        assert_eq!(err.to_string(), "invalid channel id: \"nope\"");

        let err = TypesError::UnknownEvent("shout".to_string());
        assert_eq!(err.to_string(), "unknown event: shout");
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<TypesError>();
    }
}
