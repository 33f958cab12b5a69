//! # hass-bridge
//!
//! Many concurrent callers and event subscribers over one Home Assistant
//! WebSocket connection.
//!
//! ## Overview
//!
//! - [`Gateway`] is the facade: `call` a request and await its reply,
//!   `subscribe` a handler to an event kind and entity, `unsubscribe`
//! - [`RequestMultiplexer`] matches replies to callers by correlation id and
//!   resolves each call exactly once: reply, timeout, connection loss or
//!   cancellation
//! - Events are fanned out by the [`hass_events::EventRouter`]; the hub
//!   `subscribe_events` handshakes follow local demand and are replayed
//!   after every reconnect
//! - A rejected access token puts the gateway in a degraded state where
//!   every call fails immediately with [`BridgeError::BridgeUnavailable`]
//!   until [`Gateway::restart`]
//!
//! ## Usage
//!
//! ```rust,ignore
//! use hass_bridge::{logging, BridgeConfig, Gateway};
//! use hass_protocol::HubRequest;
//!
//! logging::init_logging_from_env()?;
//!
//! let gateway = Gateway::start(BridgeConfig::from_env()?)?;
//! gateway.wait_ready(std::time::Duration::from_secs(10)).await?;
//!
//! let config = gateway.call(HubRequest::GetConfig, None).await?;
//! println!("hub location: {}", config["location_name"]);
//! ```

pub mod config;
pub mod devices;
pub mod error;
pub mod logging;

mod demux;
mod gateway;
mod listener;
mod multiplexer;

pub use config::BridgeConfig;
pub use devices::{DeviceSummary, EntitySummary};
pub use error::{BridgeError, Result};
pub use gateway::{BridgeStats, Gateway};
pub use multiplexer::{MultiplexerStats, RequestMultiplexer};

// Re-export commonly used types from the layers below
pub use hass_events::{
    EventHandler, HandlerResult, SubjectFilter, SubscriptionGuard, SubscriptionId,
};
pub use hass_protocol::{EventFrame, EventKind, HubRequest, ServiceTarget, SubjectId, Value};
pub use hass_session::{SessionConfig, SessionState};
