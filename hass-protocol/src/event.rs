//! Event kinds, subject identifiers and decoded event frames

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Kind of unsolicited event pushed by the hub
///
/// The hub names events with free-form strings. The kinds the bridge knows
/// about get their own variant; everything else is carried verbatim in
/// `Other` so it can still be subscribed to and routed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    /// An entity's state object changed
    StateChanged,
    /// A service was called on the hub
    CallService,
    /// An automation fired
    AutomationTriggered,
    /// An integration finished loading
    ComponentLoaded,
    /// A new service became available
    ServiceRegistered,
    /// Any event type the bridge has no variant for
    Other(String),
}

impl EventKind {
    /// Get the hub's name for this event kind
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StateChanged => "state_changed",
            EventKind::CallService => "call_service",
            EventKind::AutomationTriggered => "automation_triggered",
            EventKind::ComponentLoaded => "component_loaded",
            EventKind::ServiceRegistered => "service_registered",
            EventKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for EventKind {
    fn from(s: &str) -> Self {
        match s {
            "state_changed" => EventKind::StateChanged,
            "call_service" => EventKind::CallService,
            "automation_triggered" => EventKind::AutomationTriggered,
            "component_loaded" => EventKind::ComponentLoaded,
            "service_registered" => EventKind::ServiceRegistered,
            other => EventKind::Other(other.to_string()),
        }
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        EventKind::from(s.as_str())
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Other(name) => name,
            known => known.as_str().to_string(),
        }
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(EventKind::from(s))
    }
}

/// Identifier of the entity an event concerns, e.g. `light.kitchen`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(String);

impl SubjectId {
    /// Creates a new SubjectId
    ///
    /// Surrounding whitespace is trimmed so ids pulled from request bodies
    /// compare equal to ids pulled from hub frames.
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        let trimmed = id.trim();
        if trimmed.len() == id.len() {
            Self(id)
        } else {
            Self(trimmed.to_string())
        }
    }

    /// Get the ID as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The domain part of an entity id (`light` for `light.kitchen`)
    pub fn domain(&self) -> Option<&str> {
        self.0.split_once('.').map(|(domain, _)| domain)
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        SubjectId::new(s)
    }
}

impl From<String> for SubjectId {
    fn from(s: String) -> Self {
        SubjectId::new(s)
    }
}

/// A decoded unsolicited event from the hub
///
/// Constructed from an inbound `event` frame and handed to the router. The
/// raw `data` object is kept alongside the extracted state pair so handlers
/// of kinds the bridge does not model can still read their payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventFrame {
    /// Event kind discriminator
    pub kind: EventKind,
    /// Entity the event concerns, if any
    pub subject: Option<SubjectId>,
    /// State after the change
    pub new_state: Option<Value>,
    /// State before the change
    pub old_state: Option<Value>,
    /// Full `data` object as sent by the hub
    pub data: Value,
    /// `LOCAL` or `REMOTE`
    pub origin: Option<String>,
    /// When the hub fired the event
    pub time_fired: Option<DateTime<Utc>>,
}

impl EventFrame {
    /// Build a frame from the hub's `event` object
    ///
    /// `event_type` selects the kind; `data.entity_id`, `data.new_state` and
    /// `data.old_state` are lifted out when present. A `null` state is
    /// treated the same as a missing one (the hub sends `old_state: null`
    /// for newly created entities).
    pub fn from_raw(
        event_type: &str,
        data: Value,
        origin: Option<String>,
        time_fired: Option<DateTime<Utc>>,
    ) -> Self {
        let subject = data
            .get("entity_id")
            .and_then(Value::as_str)
            .map(SubjectId::new);
        let new_state = non_null(data.get("new_state"));
        let old_state = non_null(data.get("old_state"));

        Self {
            kind: EventKind::from(event_type),
            subject,
            new_state,
            old_state,
            data,
            origin,
            time_fired,
        }
    }

    /// Convenience constructor for a `state_changed` frame
    pub fn state_changed(
        subject: impl Into<SubjectId>,
        old_state: Option<Value>,
        new_state: Option<Value>,
    ) -> Self {
        let subject = subject.into();
        let data = serde_json::json!({
            "entity_id": subject.as_str(),
            "old_state": old_state.clone().unwrap_or(Value::Null),
            "new_state": new_state.clone().unwrap_or(Value::Null),
        });

        Self {
            kind: EventKind::StateChanged,
            subject: Some(subject),
            new_state,
            old_state,
            data,
            origin: None,
            time_fired: None,
        }
    }

    /// The `state` string of the new state object, e.g. `"on"`
    pub fn new_state_value(&self) -> Option<&str> {
        self.new_state.as_ref()?.get("state")?.as_str()
    }

    /// The `state` string of the old state object
    pub fn old_state_value(&self) -> Option<&str> {
        self.old_state.as_ref()?.get("state")?.as_str()
    }
}

fn non_null(value: Option<&Value>) -> Option<Value> {
    match value {
        None | Some(Value::Null) => None,
        Some(v) => Some(v.clone()),
    }
}
