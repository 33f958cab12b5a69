//! Session state machine types

use std::fmt;

use chrono::{DateTime, Utc};

/// Connection state of a session
///
/// ```text
/// Disconnected -> Connecting -> Authenticating -> Ready
///                     ^               |             |
///                     |               v             v
///                     +-------- Reconnecting <------+
///
/// Authenticating --(token rejected)--> Closed
/// any --(shutdown)--> Closed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Constructed, never started
    Disconnected,
    /// Opening the socket
    Connecting,
    /// Socket open, auth handshake in progress
    Authenticating,
    /// Authenticated; frames may be sent
    Ready,
    /// Connection lost, waiting out the backoff delay
    Reconnecting,
    /// Shut down or permanently rejected; will not reconnect on its own
    Closed,
}

impl SessionState {
    pub fn is_ready(&self) -> bool {
        matches!(self, SessionState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Get the name of this state as a string
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a session entered `Closed`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// `shutdown()` was called
    Shutdown,
    /// The hub rejected the access token
    AuthenticationRejected(String),
}

/// A single state transition, delivered to the frame sink and watchers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub from: SessionState,
    pub to: SessionState,
    pub at: DateTime<Utc>,
    /// Human-readable cause, when there is one (transport error text, etc.)
    pub reason: Option<String>,
    /// Set only on transitions into `Closed`
    pub close_reason: Option<CloseReason>,
}

impl LifecycleEvent {
    pub fn new(from: SessionState, to: SessionState, reason: Option<String>) -> Self {
        Self {
            from,
            to,
            at: Utc::now(),
            reason,
            close_reason: None,
        }
    }

    /// True when this transition takes the session out of Ready
    pub fn is_loss_of_ready(&self) -> bool {
        self.from.is_ready() && !self.to.is_ready()
    }

    /// True when this transition completes a (re)connection
    pub fn is_ready(&self) -> bool {
        self.to.is_ready() && !self.from.is_ready()
    }

    /// True when the hub rejected the credentials
    pub fn is_auth_rejection(&self) -> bool {
        matches!(self.close_reason, Some(CloseReason::AuthenticationRejected(_)))
    }
}

/// Point-in-time counters for a session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Times the session entered Reconnecting
    pub reconnects: u64,
    /// Frames decoded from the hub, including malformed ones
    pub frames_received: u64,
    /// Frames dropped as protocol violations
    pub protocol_violations: u64,
    /// Last time anything arrived from the hub
    pub last_activity: Option<DateTime<Utc>>,
    /// Version reported by the hub in the handshake
    pub hub_version: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_display() {
        assert_eq!(SessionState::Ready.to_string(), "ready");
        assert_eq!(SessionState::Reconnecting.to_string(), "reconnecting");
        assert!(SessionState::Ready.is_ready());
        assert!(SessionState::Closed.is_closed());
        assert!(!SessionState::Connecting.is_ready());
    }

    #[test]
    fn test_lifecycle_predicates() {
        let lost = LifecycleEvent::new(SessionState::Ready, SessionState::Reconnecting, None);
        assert!(lost.is_loss_of_ready());
        assert!(!lost.is_ready());

        let up = LifecycleEvent::new(SessionState::Authenticating, SessionState::Ready, None);
        assert!(up.is_ready());
        assert!(!up.is_loss_of_ready());

        let mut rejected =
            LifecycleEvent::new(SessionState::Authenticating, SessionState::Closed, None);
        rejected.close_reason = Some(CloseReason::AuthenticationRejected("bad".into()));
        assert!(rejected.is_auth_rejection());
        assert!(!rejected.is_loss_of_ready());
    }
}
