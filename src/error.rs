//! Error types for xwire-client.

use std::fmt;

use thiserror::Error;

/// Why a connection stopped accepting work.
///
/// Recorded once on the connection when a transport-level failure happens;
/// every later operation reports it without touching the socket again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
    /// A read, write or readiness wait on the socket failed.
    SocketError,
    /// The server closed the connection.
    Closed,
    /// The inbound byte stream could not be framed.
    Desynchronized,
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::SocketError => f.write_str("socket error"),
            ShutdownReason::Closed => f.write_str("closed by server"),
            ShutdownReason::Desynchronized => f.write_str("protocol desynchronized"),
        }
    }
}

/// Main error type for all xwire operations.
#[derive(Debug, Error)]
pub enum XwireError {
    /// I/O error during socket operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading a configuration.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The connection was shut down by an earlier transport failure.
    #[error("Connection shut down: {0}")]
    ConnectionShutdown(ShutdownReason),

    /// The server refused the connection during the handshake.
    #[error("Connection setup failed: {reason}")]
    SetupFailed {
        /// Reason text sent by the server.
        reason: String,
    },

    /// The server asked for further authentication during the handshake.
    #[error("Connection setup requires authentication: {reason}")]
    SetupAuthenticate {
        /// Reason text sent by the server.
        reason: String,
    },

    /// A request is longer than the server accepts.
    #[error("Request of {length} units exceeds maximum {maximum}")]
    RequestTooLarge {
        /// Request length in 4-byte units.
        length: u64,
        /// Largest length the server accepts, in 4-byte units.
        maximum: u32,
    },

    /// A request targets an extension the server does not provide.
    #[error("Extension {0} is not present on the server")]
    ExtensionMissing(&'static str),

    /// A display name could not be parsed.
    #[error("Invalid display name: {0:?}")]
    InvalidDisplay(String),

    /// Protocol error (malformed packet, misuse of a sequence number, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The server has no more resource ids to hand out.
    #[error("Resource id space exhausted")]
    XidExhausted,
}

/// Result type alias using XwireError.
pub type Result<T> = std::result::Result<T, XwireError>;
