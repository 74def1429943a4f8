//! Error types for sockrpc.

use serde_json::Value;
use thiserror::Error;

use crate::validate::ValidationErrors;

/// Main error type for all sockrpc operations.
#[derive(Debug, Error)]
pub enum SockRpcError {
    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Protocol error (malformed frame, unexpected response, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The configured frame limit cannot hold a chunk header plus one character.
    #[error("Frame limit of {limit} bytes is too small for transit {transit_id}")]
    FrameLimitTooSmall { limit: usize, transit_id: String },

    /// Settings that cannot work together.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// The socket capability failed to open or send.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Connection closed before the operation completed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No socket is currently open.
    #[error("Not connected")]
    NotConnected,

    /// A newer `connect()` replaced this connection attempt.
    #[error("Connection attempt superseded by a newer connect")]
    Superseded,

    /// The remote peer answered a call with an error frame.
    #[error("Remote error: {message}")]
    Remote {
        message: String,
        details: Option<Value>,
    },

    /// A handler failed with an application-level message.
    #[error("Handler error: {0}")]
    Handler(String),

    /// Input rejected by a schema validator.
    #[error("Validation failed: {0}")]
    Validation(ValidationErrors),
}

impl SockRpcError {
    /// Shorthand for handlers that fail with a plain message.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler(message.into())
    }
}

/// Result type alias using SockRpcError.
pub type Result<T> = std::result::Result<T, SockRpcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_display() {
        let err = SockRpcError::Remote {
            message: "boom".to_string(),
            details: None,
        };
        assert_eq!(err.to_string(), "Remote error: boom");
    }

    #[test]
    fn test_json_error_from() {
        let parse = serde_json::from_str::<Value>("{").unwrap_err();
        let err: SockRpcError = parse.into();
        assert!(matches!(err, SockRpcError::Json(_)));
    }
}
