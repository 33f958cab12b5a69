//! # hass-events
//!
//! Fan-out of unsolicited hub events to local subscribers.
//!
//! Subscribers register a handler for an event kind and either one entity
//! or every entity. Inbound frames are routed by (kind, subject) lookup and
//! queued per subscription, so routing never waits for a handler and one
//! misbehaving handler never affects another.
//!
//! ## Reference-counted listening
//!
//! The hub only sends events of a kind after an explicit
//! `subscribe_events`. The router keeps a count of subscriptions per kind
//! and reports the first and last one as [`ListenCommand`]s, so whoever
//! owns the connection can start and stop listening upstream on demand.
//!
//! ```rust,ignore
//! use hass_events::{EventRouter, HandlerResult, SubjectFilter};
//! use hass_protocol::{EventFrame, EventKind};
//!
//! let router = EventRouter::new()?;
//! let guard = router.subscribe_scoped(
//!     EventKind::StateChanged,
//!     "light.kitchen",
//!     |event: &EventFrame| -> HandlerResult {
//!         println!("kitchen light: {:?}", event.new_state_value());
//!         Ok(())
//!     },
//! );
//! ```

mod error;
mod handler;
mod router;
mod subscription;

pub use error::{Result, RouterError};
pub use handler::{EventHandler, HandlerError, HandlerResult};
pub use router::{EventRouter, ListenCommand, RouterStats, SUBSCRIPTION_QUEUE_CAPACITY};
pub use subscription::{SubjectFilter, SubscriptionGuard, SubscriptionId};
