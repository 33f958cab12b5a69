//! Bridge configuration

use std::time::Duration;

use hass_protocol::EventKind;
use hass_session::SessionConfig;

use crate::error::{BridgeError, Result};

/// Hub address, e.g. `http://homeassistant.local:8123`
pub const ENV_URL: &str = "HASS_URL";
/// Long-lived access token
pub const ENV_TOKEN: &str = "HASS_TOKEN";
/// Default per-call timeout in seconds
pub const ENV_CALL_TIMEOUT: &str = "HASS_CALL_TIMEOUT_SECS";
/// Upper bound of the reconnect backoff in seconds
pub const ENV_RECONNECT_MAX: &str = "HASS_RECONNECT_MAX_SECS";
/// Idle time before a liveness ping, in seconds
pub const ENV_LIVENESS_INTERVAL: &str = "HASS_LIVENESS_INTERVAL_SECS";

/// Configuration for a [`Gateway`](crate::Gateway)
///
/// Immutable once the gateway is built.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Connection settings for the underlying session
    pub session: SessionConfig,

    /// Timeout applied to calls that do not set their own
    /// Default: 10 seconds
    pub call_timeout: Duration,

    /// Event kinds to listen for on the hub even with no local subscriber
    /// Default: `state_changed`
    pub listen_kinds: Vec<EventKind>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            call_timeout: Duration::from_secs(10),
            listen_kinds: vec![EventKind::StateChanged],
        }
    }
}

impl BridgeConfig {
    /// Create a config for a hub address and access token
    pub fn new(hub_address: &str, access_token: impl Into<String>) -> Result<Self> {
        Ok(Self {
            session: SessionConfig::new(hub_address, access_token)?,
            ..Default::default()
        })
    }

    /// Create a config with short timeouts and fast reconnects, for tests
    /// against a local hub
    pub fn fast() -> Self {
        Self {
            session: SessionConfig::fast_reconnect(),
            call_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Load from `HASS_URL`, `HASS_TOKEN` and the optional tuning variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source using the `HASS_*` names
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let url = lookup(ENV_URL)
            .ok_or_else(|| BridgeError::Configuration(format!("{} is not set", ENV_URL)))?;
        let token = lookup(ENV_TOKEN)
            .ok_or_else(|| BridgeError::Configuration(format!("{} is not set", ENV_TOKEN)))?;

        let mut config = Self::new(&url, token)?;

        if let Some(secs) = parse_secs(&lookup, ENV_CALL_TIMEOUT)? {
            config.call_timeout = secs;
        }
        if let Some(max) = parse_secs(&lookup, ENV_RECONNECT_MAX)? {
            let min = config.session.reconnect_min.min(max);
            config.session = config.session.with_reconnect_backoff(min, max);
        }
        if let Some(interval) = parse_secs(&lookup, ENV_LIVENESS_INTERVAL)? {
            let timeout = config.session.liveness_timeout;
            config.session = config.session.with_liveness(interval, timeout);
        }

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<()> {
        self.session.validate()?;

        if self.call_timeout.is_zero() {
            return Err(BridgeError::Configuration(
                "Call timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_session(mut self, session: SessionConfig) -> Self {
        self.session = session;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_listen_kinds(mut self, kinds: Vec<EventKind>) -> Self {
        self.listen_kinds = kinds;
        self
    }
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<Duration>> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u64>()
            .map(|secs| Some(Duration::from_secs(secs)))
            .map_err(|_| {
                BridgeError::Configuration(format!("{} must be a whole number of seconds, got {:?}", key, raw))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.call_timeout, Duration::from_secs(10));
        assert_eq!(config.listen_kinds, vec![EventKind::StateChanged]);
        // No token by default
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_lookup() {
        let config = BridgeConfig::from_lookup(lookup_from(&[
            (ENV_URL, "http://hub.local:8123"),
            (ENV_TOKEN, "abc"),
            (ENV_CALL_TIMEOUT, "3"),
            (ENV_RECONNECT_MAX, "20"),
        ]))
        .unwrap();

        assert_eq!(config.session.hub_url.as_str(), "ws://hub.local:8123/api/websocket");
        assert_eq!(config.call_timeout, Duration::from_secs(3));
        assert_eq!(config.session.reconnect_max, Duration::from_secs(20));
    }

    #[test]
    fn test_from_lookup_missing_token() {
        let err = BridgeConfig::from_lookup(lookup_from(&[(ENV_URL, "http://hub.local:8123")]))
            .unwrap_err();
        assert_eq!(err, BridgeError::Configuration("HASS_TOKEN is not set".to_string()));
    }

    #[test]
    fn test_from_lookup_bad_number() {
        let err = BridgeConfig::from_lookup(lookup_from(&[
            (ENV_URL, "http://hub.local:8123"),
            (ENV_TOKEN, "abc"),
            (ENV_CALL_TIMEOUT, "soon"),
        ]))
        .unwrap_err();
        assert!(matches!(err, BridgeError::Configuration(msg) if msg.contains(ENV_CALL_TIMEOUT)));
    }

    #[test]
    fn test_zero_call_timeout_rejected() {
        let config = BridgeConfig::new("http://hub.local:8123", "abc")
            .unwrap()
            .with_call_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = BridgeConfig::fast()
            .with_call_timeout(Duration::from_millis(500))
            .with_listen_kinds(vec![]);
        assert_eq!(config.call_timeout, Duration::from_millis(500));
        assert!(config.listen_kinds.is_empty());
    }

    proptest::proptest! {
        #[test]
        fn prop_call_timeout_from_lookup(secs in 1u64..86_400) {
            let raw = secs.to_string();
            let config = BridgeConfig::from_lookup(lookup_from(&[
                (ENV_URL, "http://hub.local:8123"),
                (ENV_TOKEN, "abc"),
                (ENV_CALL_TIMEOUT, raw.as_str()),
            ]))
            .unwrap();
            proptest::prop_assert_eq!(config.call_timeout, Duration::from_secs(secs));
        }

        #[test]
        fn prop_non_numeric_timeout_rejected(raw in "[a-z][a-z0-9 ]{0,8}") {
            let result = BridgeConfig::from_lookup(lookup_from(&[
                (ENV_URL, "http://hub.local:8123"),
                (ENV_TOKEN, "abc"),
                (ENV_CALL_TIMEOUT, raw.as_str()),
            ]));
            proptest::prop_assert!(result.is_err());
        }
    }
}
