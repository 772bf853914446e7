//! Relay error taxonomy
//!
//! Nothing in here is fatal to the process. Connection errors are retried,
//! decode errors drop a single frame, send errors drop a single subscriber and
//! merge conflicts are overwritten and logged.

use thiserror::Error;

/// Errors raised by the state relay core.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Transient transport failure (refused, handshake, closed mid-stream).
    #[error("connection error: {0}")]
    Connection(String),

    /// A frame could not be decoded; the frame is dropped.
    #[error("protocol decode error: {0}")]
    ProtocolDecode(String),

    /// Delivery to one subscriber failed.
    #[error("send to connection {connection_id} failed: {reason}")]
    Send { connection_id: u64, reason: String },

    /// A merge replaced a value of a different shape (scalar vs mapping).
    #[error("merge conflict at '{path}': {from} replaced by {to}")]
    MergeConflict {
        path: String,
        from: &'static str,
        to: &'static str,
    },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The state hub actor has stopped.
    #[error("state hub is not running")]
    HubClosed,
}

impl From<serde_json::Error> for RelayError {
    fn from(e: serde_json::Error) -> Self {
        RelayError::ProtocolDecode(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for RelayError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        RelayError::Connection(e.to_string())
    }
}

/// Result type for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
