//! The seam between the session and whatever consumes its frames

use hass_protocol::{InboundFrame, ProtocolError};

use crate::state::LifecycleEvent;

/// Consumer of everything the session receives
///
/// The session calls these methods from its single reader task, in the
/// order frames arrive. Implementations must return quickly and must not
/// block: anything slow belongs on another task.
pub trait FrameSink: Send + Sync + 'static {
    /// A decoded frame (replies and events; handshake and session-owned
    /// pongs never reach the sink)
    fn on_frame(&self, frame: InboundFrame);

    /// A state transition. Called after the new state is visible through
    /// `Session::state()`, before the session does anything else.
    fn on_lifecycle(&self, event: &LifecycleEvent);

    /// A frame that could not be decoded and was dropped
    fn on_protocol_violation(&self, _error: &ProtocolError) {}
}
