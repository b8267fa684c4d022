//! Transport, remote and configuration error types.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors produced by the transport itself.
///
/// Server-reported failures are not transport failures: they travel inside a
/// [`Response`](crate::codec::Response) as a [`RemoteError`] and only become
/// [`TransportError::Remote`] through [`Connection::call`](crate::Connection::call).
#[derive(Debug, Error)]
pub enum TransportError {
    /// The WebSocket could not be established.
    #[error("failed to connect to {url}: {reason}")]
    Connect {
        /// The address that was dialed.
        url: String,
        /// Why the dial failed.
        reason: String,
    },

    /// A request could not be serialized or written to the socket.
    #[error("failed to send {method}: {reason}")]
    Send {
        /// Method of the request that failed.
        method: String,
        /// Why it failed.
        reason: String,
    },

    /// An inbound frame could not be decoded.
    #[error("malformed frame: {reason}")]
    MalformedFrame {
        /// What was wrong with the frame.
        reason: String,
    },

    /// The connection is closing or closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No reply arrived before the deadline.
    #[error("timed out after {timeout_ms}ms waiting for {method} (id {id})")]
    Timeout {
        /// Correlation id of the request.
        id: u64,
        /// Method of the request.
        method: String,
        /// How long we waited.
        timeout_ms: u64,
    },

    /// The server answered with an error.
    #[error(transparent)]
    Remote(#[from] RemoteError),
}

impl TransportError {
    /// Whether this error means the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::Connect { .. } | Self::MalformedFrame { .. } | Self::ConnectionClosed
        )
    }
}

/// Error object returned by the server in a reply's `error` field.
#[derive(Clone, Debug, PartialEq, Error, Serialize, Deserialize)]
#[error("[{code}] {message}")]
pub struct RemoteError {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
    /// Optional auxiliary data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Errors from loading or validating a [`ConnectionConfig`](crate::ConnectionConfig).
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A configuration source could not be read or extracted.
    #[error("failed to load connection config: {0}")]
    Load(#[from] figment::Error),

    /// A value was out of range or otherwise unusable.
    #[error("invalid connection config value: {0}")]
    InvalidValue(String),
}

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
