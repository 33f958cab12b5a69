//! # hass-protocol
//!
//! Typed frames for the Home Assistant WebSocket API.
//!
//! This crate knows nothing about sockets, sessions or timing. It turns
//! [`HubRequest`] values into the JSON text the hub expects and turns the
//! hub's JSON text back into [`InboundFrame`] values, rejecting anything
//! that does not match the contract with a [`ProtocolError`].
//!
//! ```rust
//! use hass_protocol::{decode_message, HubRequest, InboundFrame, OutgoingFrame};
//!
//! let text = OutgoingFrame::new(1, HubRequest::GetStates).encode().unwrap();
//! assert!(text.contains("get_states"));
//!
//! let frames = decode_message(r#"{"id": 1, "type": "result", "success": true, "result": []}"#);
//! assert!(matches!(frames[0], Ok(InboundFrame::Reply(_))));
//! ```

mod error;
mod event;
mod frame;
mod request;

pub use error::{ProtocolError, Result};
pub use event::{EventFrame, EventKind, SubjectId};
pub use frame::{decode_message, ErrorDescriptor, InboundFrame, ReplyFrame};
pub use request::{encode_auth, HubRequest, OutgoingFrame, ServiceTarget};

// Payloads are opaque JSON throughout the bridge
pub use serde_json::Value;
