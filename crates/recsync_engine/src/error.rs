//! Error types for the sync engine.

use recsync_protocol::ProtocolError;
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The server answered with a status other than 200 or 403.
    #[error("server returned status {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Response body or reason.
        message: String,
    },

    /// The server rejected the credential (HTTP 403).
    #[error("authorization failed: {0}")]
    Unauthorized(String),

    /// The response body does not match the expected line/column shape.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Timeout.
    #[error("operation timed out")]
    Timeout,

    /// The model was never registered with the engine.
    #[error("unknown model: {0}")]
    UnknownModel(String),

    /// No local record with the given client id.
    #[error("record {client_id} not found in model {model}")]
    RecordNotFound {
        /// Model name.
        model: String,
        /// Client id that was looked up.
        client_id: String,
    },

    /// A local write violates the record lifecycle.
    #[error("invalid write: {0}")]
    InvalidWrite(String),

    /// The local store failed to read or persist data.
    #[error("storage error: {0}")]
    Storage(String),

    /// The credential provider failed.
    #[error("credential error: {0}")]
    Credential(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Server { .. } => true,
            SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true if the user must sign in again.
    pub fn needs_reauthentication(&self) -> bool {
        matches!(self, SyncError::Unauthorized(_))
    }
}

impl From<std::io::Error> for SyncError {
    fn from(err: std::io::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Storage(err.to_string())
    }
}
