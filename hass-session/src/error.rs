//! Error types for the hass-session crate.

use std::time::Duration;

use hass_protocol::ProtocolError;

/// Errors that can occur while establishing or using a session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// No Ready connection exists; the frame was not queued
    #[error("Not connected to the hub")]
    NotConnected,

    /// The hub rejected the access token. Fatal: retrying cannot help.
    #[error("Authentication rejected by hub: {0}")]
    AuthenticationFailed(String),

    /// The hub did not complete the auth handshake in time
    #[error("Authentication handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// Socket-level failure (connect, read or write)
    #[error("Transport error: {0}")]
    Transport(String),

    /// The hub sent something outside the wire contract
    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    /// Invalid configuration provided
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// `start` was called outside a tokio runtime
    #[error("No tokio runtime available to drive the session")]
    NoRuntime,
}

impl SessionError {
    /// Whether a reconnect attempt could fix this error
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SessionError::AuthenticationFailed(_)
                | SessionError::Configuration(_)
                | SessionError::NoRuntime
        )
    }
}

/// Convenience type alias for Results using SessionError.
pub type Result<T> = std::result::Result<T, SessionError>;
