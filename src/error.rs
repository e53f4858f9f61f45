//! Error types for the Syncplay client.

use thiserror::Error;

/// Errors that can occur when using the Syncplay client.
#[derive(Debug, Error)]
pub enum SyncplayError {
    /// An I/O error on the underlying TCP connection (refused, reset, broken pipe).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The server closed the connection before the TLS capability exchange finished.
    #[error("connection closed during TLS negotiation")]
    HandshakeIncomplete,

    /// TLS upgrade failed. Certificate validation failures land here; the
    /// connection attempt is aborted rather than downgraded to plaintext.
    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    /// Failed to decode an inbound line as a protocol envelope. The stream can
    /// no longer be trusted to be in sync, so this terminates the read loop.
    #[error("protocol decode error: {0}")]
    Protocol(#[from] serde_json::Error),

    /// Attempted an operation that requires an active connection, but the
    /// client is not connected.
    #[error("not connected to server")]
    NotConnected,

    /// A user lookup that requires the user to exist came up empty.
    #[error("no such user: {0}")]
    UnknownUser(String),

    /// A join event referenced a username already present in the registry.
    #[error("user already in registry: {0}")]
    DuplicateUser(String),

    /// The connect or read loop was stopped by the caller's cancellation token.
    #[error("operation cancelled")]
    Cancelled,
}

/// A specialized [`Result`] type for Syncplay client operations.
pub type Result<T> = std::result::Result<T, SyncplayError>;
