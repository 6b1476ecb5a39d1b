//! Error types for mqtt3.

use std::io;

/// Result type alias for mqtt3.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqtt3 operations.
///
/// Incomplete input is never an error: the frame reader reports it as
/// `Ok(None)` and the caller waits for more bytes.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or illegal packet content. Always fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Protocol feature or level this crate does not speak (e.g. MQTT 5.0).
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Connection refused by broker.
    #[error("connection refused: {0}")]
    ConnectionRefused(String),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The connection's cancellation token fired.
    #[error("cancelled")]
    Cancelled,

    /// Unexpected packet received.
    #[error("unexpected packet: expected {expected}, got {got}")]
    UnexpectedPacket { expected: String, got: String },

    /// Timeout error.
    #[error("timeout: {0}")]
    Timeout(String),

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// Broker is already running.
    #[error("broker already running")]
    AlreadyRunning,
}

impl Error {
    /// Shorthand for building a [`Error::Protocol`].
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Whether this error is an orderly end of the connection rather than a fault.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionClosed | Error::Cancelled)
    }
}
