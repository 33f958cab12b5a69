//! Outgoing request frames
//!
//! Every request the bridge can issue is a variant of [`HubRequest`]. The
//! correlation id is not part of the request itself: it is assigned when the
//! request is framed for a particular connection, see [`OutgoingFrame`].

use serde_json::{json, Map, Value};

use crate::error::{ProtocolError, Result};
use crate::event::{EventKind, SubjectId};

/// A request the hub understands
#[derive(Debug, Clone, PartialEq)]
pub enum HubRequest {
    /// Fetch every entity's current state object
    GetStates,
    /// Fetch the hub's core configuration
    GetConfig,
    /// Fetch every service the hub exposes, grouped by domain
    GetServices,
    /// List registered devices
    DeviceRegistryList,
    /// List registered entities
    EntityRegistryList,
    /// List configured areas
    AreaRegistryList,
    /// Call a service, e.g. `light.turn_on`
    CallService {
        domain: String,
        service: String,
        service_data: Option<Value>,
        target: Option<ServiceTarget>,
    },
    /// Start receiving events of one kind (or all kinds when `None`)
    SubscribeEvents { event_type: Option<EventKind> },
    /// Stop a subscription created with `SubscribeEvents`
    UnsubscribeEvents { subscription: u64 },
    /// Liveness probe
    Ping,
    /// Any other command; `fields` are sent as-is next to `type`
    Custom { kind: String, fields: Map<String, Value> },
}

/// Target selector for a service call
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceTarget {
    pub entity_id: Vec<SubjectId>,
    pub device_id: Vec<String>,
    pub area_id: Vec<String>,
}

impl ServiceTarget {
    /// Target a single entity
    pub fn entity(id: impl Into<SubjectId>) -> Self {
        Self {
            entity_id: vec![id.into()],
            ..Default::default()
        }
    }

    fn to_value(&self) -> Value {
        let mut target = Map::new();
        if !self.entity_id.is_empty() {
            let ids: Vec<&str> = self.entity_id.iter().map(SubjectId::as_str).collect();
            target.insert("entity_id".into(), json!(ids));
        }
        if !self.device_id.is_empty() {
            target.insert("device_id".into(), json!(self.device_id));
        }
        if !self.area_id.is_empty() {
            target.insert("area_id".into(), json!(self.area_id));
        }
        Value::Object(target)
    }
}

impl HubRequest {
    /// Build a `call_service` request
    pub fn call_service(domain: impl Into<String>, service: impl Into<String>) -> Self {
        HubRequest::CallService {
            domain: domain.into(),
            service: service.into(),
            service_data: None,
            target: None,
        }
    }

    /// Build an opaque request from a JSON object carrying its own `type`
    ///
    /// Any `id` field in the object is discarded; ids belong to the framing.
    pub fn custom(payload: Value) -> Result<Self> {
        let Value::Object(mut fields) = payload else {
            return Err(ProtocolError::Encode(
                "custom request payload must be a JSON object".to_string(),
            ));
        };
        let kind = match fields.remove("type") {
            Some(Value::String(kind)) if !kind.is_empty() => kind,
            _ => return Err(ProtocolError::MissingType),
        };
        fields.remove("id");
        Ok(HubRequest::Custom { kind, fields })
    }

    /// The wire `type` of this request
    pub fn kind(&self) -> &str {
        match self {
            HubRequest::GetStates => "get_states",
            HubRequest::GetConfig => "get_config",
            HubRequest::GetServices => "get_services",
            HubRequest::DeviceRegistryList => "config/device_registry/list",
            HubRequest::EntityRegistryList => "config/entity_registry/list",
            HubRequest::AreaRegistryList => "config/area_registry/list",
            HubRequest::CallService { .. } => "call_service",
            HubRequest::SubscribeEvents { .. } => "subscribe_events",
            HubRequest::UnsubscribeEvents { .. } => "unsubscribe_events",
            HubRequest::Ping => "ping",
            HubRequest::Custom { kind, .. } => kind,
        }
    }

    /// Encode as a JSON object without an id
    pub fn to_value(&self) -> Value {
        let mut body = Map::new();
        body.insert("type".into(), Value::String(self.kind().to_string()));

        match self {
            HubRequest::CallService {
                domain,
                service,
                service_data,
                target,
            } => {
                body.insert("domain".into(), json!(domain));
                body.insert("service".into(), json!(service));
                if let Some(data) = service_data {
                    body.insert("service_data".into(), data.clone());
                }
                if let Some(target) = target {
                    body.insert("target".into(), target.to_value());
                }
            }
            HubRequest::SubscribeEvents {
                event_type: Some(kind),
            } => {
                body.insert("event_type".into(), json!(kind.as_str()));
            }
            HubRequest::UnsubscribeEvents { subscription } => {
                body.insert("subscription".into(), json!(subscription));
            }
            HubRequest::Custom { fields, .. } => {
                for (key, value) in fields {
                    if key != "type" && key != "id" {
                        body.insert(key.clone(), value.clone());
                    }
                }
            }
            _ => {}
        }

        Value::Object(body)
    }
}

/// A request bound to a correlation id, ready to be written to the socket
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingFrame {
    /// Correlation id, echoed by the hub's reply
    pub id: u64,
    /// What is being asked
    pub request: HubRequest,
}

impl OutgoingFrame {
    pub fn new(id: u64, request: HubRequest) -> Self {
        Self { id, request }
    }

    /// Serialize to the JSON text sent over the socket
    pub fn encode(&self) -> Result<String> {
        let mut value = self.request.to_value();
        if let Value::Object(ref mut body) = value {
            body.insert("id".into(), json!(self.id));
        }
        serde_json::to_string(&value).map_err(|e| ProtocolError::Encode(e.to_string()))
    }
}

/// The authentication message sent right after `auth_required`
///
/// Not an [`OutgoingFrame`]: the handshake happens before ids are in use.
pub fn encode_auth(access_token: &str) -> String {
    json!({ "type": "auth", "access_token": access_token }).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn encoded(id: u64, request: HubRequest) -> Value {
        let text = OutgoingFrame::new(id, request).encode().unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[rstest]
    #[case(HubRequest::GetStates, "get_states")]
    #[case(HubRequest::GetConfig, "get_config")]
    #[case(HubRequest::GetServices, "get_services")]
    #[case(HubRequest::DeviceRegistryList, "config/device_registry/list")]
    #[case(HubRequest::EntityRegistryList, "config/entity_registry/list")]
    #[case(HubRequest::AreaRegistryList, "config/area_registry/list")]
    #[case(HubRequest::Ping, "ping")]
    fn test_simple_requests(#[case] request: HubRequest, #[case] wire_type: &str) {
        let frame = encoded(7, request);
        assert_eq!(frame["id"], 7);
        assert_eq!(frame["type"], wire_type);
        assert_eq!(frame.as_object().unwrap().len(), 2);
    }

    #[test]
    fn test_call_service_with_target() {
        let request = HubRequest::CallService {
            domain: "light".into(),
            service: "turn_on".into(),
            service_data: Some(json!({"brightness": 120})),
            target: Some(ServiceTarget::entity("light.kitchen")),
        };
        let frame = encoded(3, request);

        assert_eq!(frame["type"], "call_service");
        assert_eq!(frame["domain"], "light");
        assert_eq!(frame["service"], "turn_on");
        assert_eq!(frame["service_data"]["brightness"], 120);
        assert_eq!(frame["target"]["entity_id"], json!(["light.kitchen"]));
        assert!(frame["target"].get("area_id").is_none());
    }

    #[test]
    fn test_subscribe_events() {
        let frame = encoded(
            4,
            HubRequest::SubscribeEvents {
                event_type: Some(EventKind::StateChanged),
            },
        );
        assert_eq!(frame["event_type"], "state_changed");

        let all = encoded(5, HubRequest::SubscribeEvents { event_type: None });
        assert!(all.get("event_type").is_none());

        let unsub = encoded(6, HubRequest::UnsubscribeEvents { subscription: 4 });
        assert_eq!(unsub["subscription"], 4);
    }

    #[test]
    fn test_custom_request_keeps_fields_and_replaces_id() {
        let request = HubRequest::custom(json!({
            "type": "mqtt/subscribe",
            "topic": "zigbee2mqtt/#",
            "id": 999,
        }))
        .unwrap();
        assert_eq!(request.kind(), "mqtt/subscribe");

        let frame = encoded(11, request);
        assert_eq!(frame["id"], 11);
        assert_eq!(frame["type"], "mqtt/subscribe");
        assert_eq!(frame["topic"], "zigbee2mqtt/#");
    }

    #[test]
    fn test_custom_request_requires_type() {
        assert!(matches!(
            HubRequest::custom(json!({"topic": "x"})),
            Err(ProtocolError::MissingType)
        ));
        assert!(matches!(
            HubRequest::custom(json!([1, 2])),
            Err(ProtocolError::Encode(_))
        ));
    }

    #[test]
    fn test_encode_auth() {
        let value: Value = serde_json::from_str(&encode_auth("abc")).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["access_token"], "abc");
    }
}
