//! # hass-session
//!
//! One persistent, authenticated WebSocket connection to a Home Assistant
//! hub.
//!
//! The [`Session`] connects, authenticates with a long-lived access token,
//! and keeps the connection alive: it pings the hub when the line goes
//! quiet, reconnects with doubling backoff when the connection drops, and
//! gives up for good only when the hub rejects the token. Decoded frames
//! and every state transition go to a single [`FrameSink`].
//!
//! ```rust,ignore
//! use hass_session::{Session, SessionConfig};
//!
//! let config = SessionConfig::new("http://homeassistant.local:8123", token)?;
//! let session = Session::new(config)?;
//! session.start(sink)?;
//! ```

mod backoff;
mod config;
mod error;
mod session;
mod sink;
mod state;
mod transport;

pub use backoff::Backoff;
pub use config::{normalize_hub_url, SessionConfig, WEBSOCKET_PATH};
pub use error::{Result, SessionError};
pub use session::Session;
pub use sink::FrameSink;
pub use state::{CloseReason, LifecycleEvent, SessionState, SessionStats};
pub use transport::Transport;
