//! Inbound frame decoding
//!
//! The hub discriminates every message with a `type` field. Decoding is
//! strict: a frame whose `type` is unknown, or which lacks a field the
//! contract requires, is a [`ProtocolError`] rather than being silently
//! ignored, so the session can count and report violations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ProtocolError, Result};
use crate::event::EventFrame;

/// Structured error carried by a failed `result` frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Machine-readable code, e.g. `not_found`
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl std::fmt::Display for ErrorDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Reply to a request, matched to its caller by `id`
#[derive(Debug, Clone, PartialEq)]
pub struct ReplyFrame {
    /// Correlation id echoed from the request
    pub id: u64,
    /// Whether the hub accepted the request
    pub success: bool,
    /// Success payload (may be `null` for commands with no result)
    pub result: Option<Value>,
    /// Error detail when `success` is false
    pub error: Option<ErrorDescriptor>,
}

impl ReplyFrame {
    /// A successful reply with the given payload
    pub fn ok(id: u64, result: Value) -> Self {
        Self {
            id,
            success: true,
            result: Some(result),
            error: None,
        }
    }

    /// A rejected reply
    pub fn rejected(id: u64, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            id,
            success: false,
            result: None,
            error: Some(ErrorDescriptor {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    /// Collapse into the payload or the hub's error
    ///
    /// A failed reply without an error object still fails, with an
    /// `unknown_error` descriptor.
    pub fn into_result(self) -> std::result::Result<Value, ErrorDescriptor> {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| ErrorDescriptor {
                code: "unknown_error".to_string(),
                message: "hub reported failure without detail".to_string(),
            }))
        }
    }
}

/// Any frame the hub can send
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// First frame on a new connection
    AuthRequired { ha_version: Option<String> },
    /// The access token was accepted
    AuthOk { ha_version: Option<String> },
    /// The access token was rejected
    AuthInvalid { message: String },
    /// Reply to a request
    Reply(ReplyFrame),
    /// Reply to a `ping`
    Pong { id: u64 },
    /// Unsolicited event; `subscription` is the id of the `subscribe_events`
    /// request that asked for it
    Event {
        subscription: Option<u64>,
        event: EventFrame,
    },
}

#[derive(Deserialize)]
struct RawEvent {
    event_type: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    origin: Option<String>,
    #[serde(default)]
    time_fired: Option<String>,
}

impl InboundFrame {
    /// Decode one JSON object
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(mut body) = value else {
            return Err(ProtocolError::InvalidFrame {
                frame_type: "<none>".to_string(),
                reason: "frame is not a JSON object".to_string(),
            });
        };

        let frame_type = match body.remove("type") {
            Some(Value::String(t)) => t,
            _ => return Err(ProtocolError::MissingType),
        };

        let invalid = |reason: &str| ProtocolError::InvalidFrame {
            frame_type: frame_type.clone(),
            reason: reason.to_string(),
        };

        let id = body.get("id").and_then(Value::as_u64);
        let ha_version = body
            .get("ha_version")
            .and_then(Value::as_str)
            .map(str::to_string);

        match frame_type.as_str() {
            "auth_required" => Ok(InboundFrame::AuthRequired { ha_version }),
            "auth_ok" => Ok(InboundFrame::AuthOk { ha_version }),
            "auth_invalid" => Ok(InboundFrame::AuthInvalid {
                message: body
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("invalid access token")
                    .to_string(),
            }),
            "pong" => Ok(InboundFrame::Pong {
                id: id.ok_or_else(|| invalid("missing numeric id"))?,
            }),
            "result" => {
                let id = id.ok_or_else(|| invalid("missing numeric id"))?;
                let success = body
                    .get("success")
                    .and_then(Value::as_bool)
                    .ok_or_else(|| invalid("missing boolean success"))?;
                let result = match body.remove("result") {
                    None | Some(Value::Null) => None,
                    Some(v) => Some(v),
                };
                let error = body.remove("error").map(decode_error);
                Ok(InboundFrame::Reply(ReplyFrame {
                    id,
                    success,
                    result,
                    error,
                }))
            }
            "event" => {
                let raw = body
                    .remove("event")
                    .ok_or_else(|| invalid("missing event object"))?;
                let raw: RawEvent =
                    serde_json::from_value(raw).map_err(|e| invalid(e.to_string().as_str()))?;
                let time_fired = raw
                    .time_fired
                    .as_deref()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                    .map(|t| t.with_timezone(&Utc));
                Ok(InboundFrame::Event {
                    subscription: id,
                    event: EventFrame::from_raw(&raw.event_type, raw.data, raw.origin, time_fired),
                })
            }
            _ => Err(ProtocolError::UnrecognizedType(frame_type.clone())),
        }
    }
}

fn decode_error(value: Value) -> ErrorDescriptor {
    let code = match value.get("code") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Null) | None => "unknown_error".to_string(),
        Some(other) => other.to_string(),
    };
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();
    ErrorDescriptor { code, message }
}

/// Decode one text message from the socket
///
/// The hub may coalesce several frames into a JSON array; each element is
/// decoded independently so one malformed element does not hide the rest.
/// A message that is not JSON at all yields a single error.
pub fn decode_message(text: &str) -> Vec<Result<InboundFrame>> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Array(items)) => items.into_iter().map(InboundFrame::from_value).collect(),
        Ok(value) => vec![InboundFrame::from_value(value)],
        Err(e) => vec![Err(ProtocolError::MalformedJson(e))],
    }
}
