use std::time::Duration;

use hass_events::RouterError;
use hass_protocol::{ErrorDescriptor, ProtocolError};
use hass_session::SessionError;
use thiserror::Error;

/// Errors surfaced to bridge callers
///
/// Transport and framing failures never reach callers directly; they show
/// up as `NotConnected` or `ConnectionLost`. `Timeout` and
/// `ConnectionLost` mean the request may or may not have taken effect on
/// the hub.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// No Ready session; nothing was sent
    #[error("Not connected to the hub")]
    NotConnected,

    /// No reply within the deadline
    #[error("No reply from the hub within {0:?}")]
    Timeout(Duration),

    /// The session dropped while the request was in flight
    #[error("Connection to the hub was lost before a reply arrived")]
    ConnectionLost,

    /// The hub rejected the access token
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The bridge is degraded after an authentication failure
    #[error("Bridge unavailable until restarted: {0}")]
    BridgeUnavailable(String),

    /// The hub answered with a structured error
    #[error("Hub rejected request ({code}): {message}")]
    UpstreamRejected { code: String, message: String },

    /// Malformed request or reply
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BridgeError {
    /// Whether retrying the same call later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::NotConnected | BridgeError::Timeout(_) | BridgeError::ConnectionLost
        )
    }

    /// Whether the hub may have acted on the request despite the failure
    pub fn is_indeterminate(&self) -> bool {
        matches!(self, BridgeError::Timeout(_) | BridgeError::ConnectionLost)
    }
}

impl From<ErrorDescriptor> for BridgeError {
    fn from(error: ErrorDescriptor) -> Self {
        BridgeError::UpstreamRejected {
            code: error.code,
            message: error.message,
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(error: ProtocolError) -> Self {
        BridgeError::ProtocolViolation(error.to_string())
    }
}

impl From<SessionError> for BridgeError {
    fn from(error: SessionError) -> Self {
        match error {
            SessionError::NotConnected
            | SessionError::Transport(_)
            | SessionError::HandshakeTimeout(_) => BridgeError::NotConnected,
            SessionError::AuthenticationFailed(message) => {
                BridgeError::AuthenticationFailed(message)
            }
            SessionError::Protocol(e) => BridgeError::ProtocolViolation(e.to_string()),
            SessionError::Configuration(message) => BridgeError::Configuration(message),
            SessionError::NoRuntime => {
                BridgeError::Configuration("A tokio runtime is required".to_string())
            }
        }
    }
}

impl From<RouterError> for BridgeError {
    fn from(error: RouterError) -> Self {
        BridgeError::Configuration(error.to_string())
    }
}

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;
