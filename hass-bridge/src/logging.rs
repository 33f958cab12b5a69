//! Logging setup for bridge applications
//!
//! The bridge crates only emit `tracing` events. Binaries pick how those
//! are rendered by calling one of the init functions here once at startup.

use tracing_subscriber::{fmt, EnvFilter, Registry};

/// Environment variable selecting the logging mode
pub const ENV_LOG_MODE: &str = "HASS_BRIDGE_LOG_MODE";
/// Environment variable overriding the log filter
pub const ENV_LOG_LEVEL: &str = "HASS_BRIDGE_LOG_LEVEL";

/// Logging mode for different use cases
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingMode {
    /// No output
    Silent,
    /// Compact stderr output for development
    Development,
    /// Verbose diagnostics with source locations
    Debug,
    /// One JSON object per line on stderr, for log collectors
    Json,
}

impl LoggingMode {
    /// Parse a mode name as used in `HASS_BRIDGE_LOG_MODE`
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "silent" | "off" => Some(LoggingMode::Silent),
            "development" | "dev" => Some(LoggingMode::Development),
            "debug" => Some(LoggingMode::Debug),
            "json" => Some(LoggingMode::Json),
            _ => None,
        }
    }
}

/// Logging configuration error
#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("Failed to initialize tracing subscriber: {0}")]
    TracingInit(String),

    #[error("Invalid environment variable: {0}")]
    InvalidEnv(String),
}

/// Initialize logging in the given mode
///
/// # Environment Variables
///
/// - `HASS_BRIDGE_LOG_LEVEL`: filter directives (e.g. `hass_session=debug`)
/// - `RUST_LOG`: used when `HASS_BRIDGE_LOG_LEVEL` is not set
pub fn init_logging(mode: LoggingMode) -> Result<(), LoggingError> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    match mode {
        LoggingMode::Silent => Ok(()),
        LoggingMode::Development => {
            let filter = create_env_filter("info")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_file(false)
                        .with_line_number(false)
                        .with_writer(std::io::stderr)
                        .compact(),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Debug => {
            let filter = create_env_filter("debug")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .pretty()
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
        LoggingMode::Json => {
            let filter = create_env_filter("info")?;

            Registry::default()
                .with(
                    fmt::layer()
                        .json()
                        .with_current_span(false)
                        .with_writer(std::io::stderr),
                )
                .with(filter)
                .try_init()
                .map_err(|e| LoggingError::TracingInit(e.to_string()))
        }
    }
}

/// Initialize logging from `HASS_BRIDGE_LOG_MODE`
///
/// Accepts `silent`, `development`, `debug` or `json`. Unset means silent;
/// anything else is an error.
pub fn init_logging_from_env() -> Result<(), LoggingError> {
    let mode = match std::env::var(ENV_LOG_MODE) {
        Ok(name) => LoggingMode::from_name(&name)
            .ok_or_else(|| LoggingError::InvalidEnv(format!("{}={}", ENV_LOG_MODE, name)))?,
        Err(_) => LoggingMode::Silent,
    };

    init_logging(mode)
}

/// Create an environment filter with fallback to default level
fn create_env_filter(default_level: &str) -> Result<EnvFilter, LoggingError> {
    if let Ok(directives) = std::env::var(ENV_LOG_LEVEL) {
        return EnvFilter::try_new(&directives)
            .map_err(|e| LoggingError::InvalidEnv(format!("{}: {}", ENV_LOG_LEVEL, e)));
    }

    if let Ok(rust_log) = std::env::var("RUST_LOG") {
        if let Ok(filter) = EnvFilter::try_new(rust_log) {
            return Ok(filter);
        }
    }

    Ok(EnvFilter::new(default_level))
}

/// Check if logging has been initialized
pub fn is_initialized() -> bool {
    tracing::dispatcher::has_been_set()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_silent_mode() {
        assert!(init_logging(LoggingMode::Silent).is_ok());
    }

    #[rstest]
    #[case("silent", Some(LoggingMode::Silent))]
    #[case("Development", Some(LoggingMode::Development))]
    #[case(" debug ", Some(LoggingMode::Debug))]
    #[case("json", Some(LoggingMode::Json))]
    #[case("loud", None)]
    fn test_mode_from_name(#[case] name: &str, #[case] expected: Option<LoggingMode>) {
        assert_eq!(LoggingMode::from_name(name), expected);
    }
}
