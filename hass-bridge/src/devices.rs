//! Device and entity views assembled from the hub's registries

use std::collections::{BTreeSet, HashMap};

use hass_protocol::{SubjectId, Value};
use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// MQTT topic that opens the Zigbee network for pairing
pub const PERMIT_JOIN_TOPIC: &str = "zigbee2mqtt/bridge/request/permit_join";

/// A registered device with the entities it provides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceSummary {
    pub id: String,
    pub name: Option<String>,
    /// Name the user gave the device, if any
    pub name_by_user: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub area_id: Option<String>,
    pub disabled_by: Option<String>,
    pub entities: Vec<EntitySummary>,
}

impl DeviceSummary {
    /// User-facing name: the user's name, else the integration's
    pub fn display_name(&self) -> &str {
        self.name_by_user
            .as_deref()
            .or(self.name.as_deref())
            .unwrap_or(&self.id)
    }
}

/// An entity with its current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntitySummary {
    pub entity_id: SubjectId,
    /// Entity domain, e.g. `light`
    pub kind: String,
    pub name: Option<String>,
    pub device_id: Option<String>,
    /// Current state string, e.g. `on`
    pub state: Option<String>,
    pub attributes: Value,
}

#[derive(Debug, Deserialize)]
struct RegistryDevice {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    name_by_user: Option<String>,
    #[serde(default)]
    manufacturer: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    area_id: Option<String>,
    #[serde(default)]
    disabled_by: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistryEntity {
    entity_id: SubjectId,
    #[serde(default)]
    device_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    original_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StateObject {
    entity_id: SubjectId,
    state: String,
    #[serde(default)]
    attributes: Value,
}

fn parse_list<T: for<'de> Deserialize<'de>>(value: Value, what: &str) -> Result<Vec<T>> {
    serde_json::from_value(value)
        .map_err(|e| BridgeError::ProtocolViolation(format!("Unexpected {} payload: {}", what, e)))
}

/// Join the entity registry with current states
///
/// Every entity with a state is listed; registry data fills in the device
/// and the configured name when the entity is registered.
pub fn assemble_entities(entity_registry: Value, states: Value) -> Result<Vec<EntitySummary>> {
    let registry: Vec<RegistryEntity> = parse_list(entity_registry, "entity registry")?;
    let states: Vec<StateObject> = parse_list(states, "state list")?;

    let by_id: HashMap<&SubjectId, &RegistryEntity> =
        registry.iter().map(|e| (&e.entity_id, e)).collect();

    let mut entities: Vec<EntitySummary> = states
        .into_iter()
        .map(|state| {
            let registered = by_id.get(&state.entity_id);
            let name = registered
                .and_then(|e| e.name.clone().or_else(|| e.original_name.clone()))
                .or_else(|| {
                    state
                        .attributes
                        .get("friendly_name")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });

            EntitySummary {
                kind: state.entity_id.domain().unwrap_or_default().to_string(),
                device_id: registered.and_then(|e| e.device_id.clone()),
                name,
                state: Some(state.state),
                attributes: state.attributes,
                entity_id: state.entity_id,
            }
        })
        .collect();

    entities.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    Ok(entities)
}

/// Group entities under the registered devices they belong to
pub fn assemble_devices(
    device_registry: Value,
    entity_registry: Value,
    states: Value,
) -> Result<Vec<DeviceSummary>> {
    let devices: Vec<RegistryDevice> = parse_list(device_registry, "device registry")?;
    let entities = assemble_entities(entity_registry, states)?;

    let mut by_device: HashMap<String, Vec<EntitySummary>> = HashMap::new();
    for entity in entities {
        if let Some(device_id) = entity.device_id.clone() {
            by_device.entry(device_id).or_default().push(entity);
        }
    }

    Ok(devices
        .into_iter()
        .map(|device| DeviceSummary {
            entities: by_device.remove(&device.id).unwrap_or_default(),
            id: device.id,
            name: device.name,
            name_by_user: device.name_by_user,
            manufacturer: device.manufacturer,
            model: device.model,
            area_id: device.area_id,
            disabled_by: device.disabled_by,
        })
        .collect())
}

/// Distinct entity domains, sorted
pub fn entity_kinds(entities: &[EntitySummary]) -> Vec<String> {
    entities
        .iter()
        .map(|e| e.kind.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

/// `service_data` for an `mqtt.publish` that opens Zigbee pairing
pub fn permit_join_data(seconds: Option<u32>) -> Value {
    let mut payload = serde_json::json!({ "value": true });
    if let Some(seconds) = seconds {
        payload["time"] = Value::from(seconds);
    }
    serde_json::json!({
        "topic": PERMIT_JOIN_TOPIC,
        "payload": payload.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fixtures() -> (Value, Value, Value) {
        let devices = json!([
            {"id": "dev1", "name": "Hue bulb", "name_by_user": "Kitchen lamp", "model": "LCT015", "area_id": "kitchen", "disabled_by": null},
            {"id": "dev2", "name": "Plug", "model": null}
        ]);
        let registry = json!([
            {"entity_id": "light.kitchen", "device_id": "dev1", "name": null, "original_name": "Hue bulb"},
            {"entity_id": "sensor.power", "device_id": "dev2", "name": "Plug power"},
            {"entity_id": "switch.orphan", "device_id": null}
        ]);
        let states = json!([
            {"entity_id": "light.kitchen", "state": "on", "attributes": {"brightness": 200}},
            {"entity_id": "sensor.power", "state": "12.5", "attributes": {}},
            {"entity_id": "sun.sun", "state": "above_horizon", "attributes": {"friendly_name": "Sun"}}
        ]);
        (devices, registry, states)
    }

    #[test]
    fn test_assemble_devices() {
        let (devices, registry, states) = fixtures();
        let devices = assemble_devices(devices, registry, states).unwrap();

        assert_eq!(devices.len(), 2);
        assert_eq!(devices[0].display_name(), "Kitchen lamp");
        assert_eq!(devices[0].entities.len(), 1);
        assert_eq!(devices[0].entities[0].state.as_deref(), Some("on"));
        assert_eq!(devices[0].entities[0].name.as_deref(), Some("Hue bulb"));
        assert_eq!(devices[1].display_name(), "Plug");
        assert_eq!(devices[1].entities[0].name.as_deref(), Some("Plug power"));
    }

    #[test]
    fn test_assemble_entities_without_registry_entry() {
        let (_, registry, states) = fixtures();
        let entities = assemble_entities(registry, states).unwrap();

        let sun = entities
            .iter()
            .find(|e| e.entity_id.as_str() == "sun.sun")
            .unwrap();
        assert_eq!(sun.kind, "sun");
        assert_eq!(sun.name.as_deref(), Some("Sun"));
        assert_eq!(sun.device_id, None);

        assert_eq!(entity_kinds(&entities), vec!["light", "sensor", "sun"]);
    }

    #[test]
    fn test_unexpected_payload() {
        let err = assemble_entities(json!({"not": "a list"}), json!([])).unwrap_err();
        assert!(matches!(err, BridgeError::ProtocolViolation(msg) if msg.contains("entity registry")));
    }

    #[test]
    fn test_permit_join_data() {
        let data = permit_join_data(Some(120));
        assert_eq!(data["topic"], PERMIT_JOIN_TOPIC);
        let payload: Value = serde_json::from_str(data["payload"].as_str().unwrap()).unwrap();
        assert_eq!(payload, json!({"value": true, "time": 120}));
    }
}
