//! Configuration types for the hass-session crate
//!
//! The session is configured once, at construction, and the configuration
//! is immutable afterwards. Loading it (from the environment, a file, a
//! settings page) is the caller's business.

use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use url::Url;

use crate::error::SessionError;

/// Path of the WebSocket API on a hub
pub const WEBSOCKET_PATH: &str = "/api/websocket";

/// Configuration for a hub session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// WebSocket endpoint of the hub
    /// Default: ws://localhost:8123/api/websocket
    pub hub_url: Url,

    /// Long-lived access token sent in the auth handshake
    pub access_token: SecretString,

    /// Time allowed for the auth handshake once the socket is open
    /// Default: 10 seconds
    pub auth_timeout: Duration,

    /// First reconnect delay, and the delay after a backoff reset
    /// Default: 1 second
    pub reconnect_min: Duration,

    /// Upper bound for the doubling reconnect delay
    /// Default: 60 seconds
    pub reconnect_max: Duration,

    /// Ready time after which the backoff resets to `reconnect_min`
    /// Default: 30 seconds
    pub backoff_reset_after: Duration,

    /// Idle time after which the session sends a ping
    /// Default: 30 seconds
    pub liveness_interval: Duration,

    /// Time allowed for the hub to answer a liveness ping
    /// Default: 10 seconds
    pub liveness_timeout: Duration,

    /// Consecutive malformed frames tolerated before the connection is dropped
    /// Default: 10
    pub max_protocol_violations: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hub_url: Url::parse("ws://localhost:8123/api/websocket")
                .expect("static default hub url is valid"),
            access_token: SecretString::new(String::new()),
            auth_timeout: Duration::from_secs(10),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(60),
            backoff_reset_after: Duration::from_secs(30),
            liveness_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(10),
            max_protocol_violations: 10,
        }
    }
}

impl SessionConfig {
    /// Create a config for a hub address and access token
    ///
    /// The address may be given as the hub's web address
    /// (`http://homeassistant.local:8123`) or as its WebSocket endpoint;
    /// see [`normalize_hub_url`].
    pub fn new(hub_address: &str, access_token: impl Into<String>) -> Result<Self, SessionError> {
        Ok(Self {
            hub_url: normalize_hub_url(hub_address)?,
            access_token: SecretString::new(access_token.into()),
            ..Default::default()
        })
    }

    /// Create a config tuned for tests against a local mock hub
    pub fn fast_reconnect() -> Self {
        Self {
            auth_timeout: Duration::from_secs(2),
            reconnect_min: Duration::from_millis(50),
            reconnect_max: Duration::from_millis(400),
            backoff_reset_after: Duration::from_secs(1),
            liveness_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// Validate the configuration and return any issues
    pub fn validate(&self) -> Result<(), SessionError> {
        match self.hub_url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SessionError::Configuration(format!(
                    "Hub url scheme must be ws or wss, got {}",
                    other
                )))
            }
        }

        if self.access_token.expose_secret().trim().is_empty() {
            return Err(SessionError::Configuration(
                "Access token must not be empty".to_string(),
            ));
        }

        if self.reconnect_min.is_zero() {
            return Err(SessionError::Configuration(
                "Minimum reconnect delay must be greater than 0".to_string(),
            ));
        }

        if self.reconnect_min > self.reconnect_max {
            return Err(SessionError::Configuration(
                "Invalid reconnect backoff: min must not exceed max".to_string(),
            ));
        }

        if self.auth_timeout.is_zero()
            || self.liveness_interval.is_zero()
            || self.liveness_timeout.is_zero()
        {
            return Err(SessionError::Configuration(
                "Handshake and liveness timeouts must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Builder pattern methods for fluent configuration

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = SecretString::new(token.into());
        self
    }

    pub fn with_hub_url(mut self, url: Url) -> Self {
        self.hub_url = url;
        self
    }

    pub fn with_reconnect_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.reconnect_min = min;
        self.reconnect_max = max;
        self
    }

    pub fn with_liveness(mut self, interval: Duration, timeout: Duration) -> Self {
        self.liveness_interval = interval;
        self.liveness_timeout = timeout;
        self
    }

    pub fn with_auth_timeout(mut self, timeout: Duration) -> Self {
        self.auth_timeout = timeout;
        self
    }

    pub fn with_backoff_reset_after(mut self, ready_for: Duration) -> Self {
        self.backoff_reset_after = ready_for;
        self
    }

    pub fn with_max_protocol_violations(mut self, max: u32) -> Self {
        self.max_protocol_violations = max;
        self
    }
}

/// Turn a hub address into its WebSocket endpoint
///
/// `http`/`https` become `ws`/`wss`, and an address with no path gets
/// [`WEBSOCKET_PATH`] appended. An `http`/`https` address with a path is
/// treated as a prefix (a hub behind a reverse proxy) and also gets
/// [`WEBSOCKET_PATH`] appended unless it already ends with it. `ws`/`wss`
/// addresses with a path are kept as they are.
pub fn normalize_hub_url(address: &str) -> Result<Url, SessionError> {
    let mut url = Url::parse(address.trim())
        .map_err(|e| SessionError::Configuration(format!("Invalid hub address {}: {}", address, e)))?;

    let from_http = matches!(url.scheme(), "http" | "https");
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SessionError::Configuration(format!(
                "Unsupported hub address scheme: {}",
                other
            )))
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        SessionError::Configuration(format!("Cannot use scheme {} for {}", scheme, address))
    })?;

    let prefix = url.path().trim_end_matches('/').to_string();
    if prefix.is_empty() {
        url.set_path(WEBSOCKET_PATH);
    } else if from_http && !prefix.ends_with(WEBSOCKET_PATH) {
        url.set_path(&format!("{}{}", prefix, WEBSOCKET_PATH));
    }

    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.hub_url.as_str(), "ws://localhost:8123/api/websocket");
        assert_eq!(config.reconnect_min, Duration::from_secs(1));
        assert_eq!(config.max_protocol_violations, 10);
        // No token by default, so the default alone is not usable
        assert!(config.validate().is_err());
        assert!(config.with_access_token("abc").validate().is_ok());
    }

    #[rstest]
    #[case("http://homeassistant.local:8123", "ws://homeassistant.local:8123/api/websocket")]
    #[case("https://hub.example.com/", "wss://hub.example.com/api/websocket")]
    #[case("ws://10.0.0.2:8123/api/websocket", "ws://10.0.0.2:8123/api/websocket")]
    #[case("wss://proxy.example.com/custom/ws", "wss://proxy.example.com/custom/ws")]
    #[case("http://host/ha/", "ws://host/ha/api/websocket")]
    #[case("https://host/ha", "wss://host/ha/api/websocket")]
    #[case("http://host/api/websocket/", "ws://host/api/websocket")]
    fn test_normalize_hub_url(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(normalize_hub_url(input).unwrap().as_str(), expected);
    }

    #[rstest]
    #[case("ftp://hub.local")]
    #[case("not a url")]
    fn test_normalize_rejects(#[case] input: &str) {
        assert!(matches!(
            normalize_hub_url(input),
            Err(SessionError::Configuration(_))
        ));
    }

    #[test]
    fn test_config_validation() {
        let inverted = SessionConfig::default()
            .with_access_token("t")
            .with_reconnect_backoff(Duration::from_secs(10), Duration::from_secs(1));
        assert!(inverted.validate().is_err());

        let zero = SessionConfig::default()
            .with_access_token("t")
            .with_reconnect_backoff(Duration::ZERO, Duration::from_secs(1));
        assert!(zero.validate().is_err());

        let no_liveness = SessionConfig::default()
            .with_access_token("t")
            .with_liveness(Duration::ZERO, Duration::from_secs(1));
        assert!(no_liveness.validate().is_err());

        let http = SessionConfig::default()
            .with_access_token("t")
            .with_hub_url(Url::parse("http://hub.local").unwrap());
        assert!(http.validate().is_err());
    }

    #[test]
    fn test_token_is_redacted_in_debug() {
        let config = SessionConfig::new("http://hub.local:8123", "super-secret").unwrap();
        assert!(!format!("{:?}", config).contains("super-secret"));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fast_reconnect_preset() {
        let config = SessionConfig::fast_reconnect().with_access_token("t");
        assert!(config.reconnect_min < Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }
}
