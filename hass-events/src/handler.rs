//! Subscriber callbacks

use hass_protocol::EventFrame;

/// Error a handler may return; logged by the router and otherwise ignored
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of one handler invocation
pub type HandlerResult = Result<(), HandlerError>;

/// A subscriber callback
///
/// Each subscription's handler runs on its own dispatch task, one event at
/// a time and in the order the hub sent them. A handler that fails or
/// panics is logged and keeps its subscription.
///
/// Any `Fn(&EventFrame) -> HandlerResult` closure is a handler:
///
/// ```rust
/// use hass_events::{EventHandler, HandlerResult};
/// use hass_protocol::EventFrame;
///
/// fn assert_handler<H: EventHandler>(_: H) {}
///
/// assert_handler(|event: &EventFrame| -> HandlerResult {
///     println!("{:?} is now {:?}", event.subject, event.new_state_value());
///     Ok(())
/// });
/// ```
pub trait EventHandler: Send + Sync + 'static {
    fn handle(&self, event: &EventFrame) -> HandlerResult;
}

impl<F> EventHandler for F
where
    F: Fn(&EventFrame) -> HandlerResult + Send + Sync + 'static,
{
    fn handle(&self, event: &EventFrame) -> HandlerResult {
        self(event)
    }
}
