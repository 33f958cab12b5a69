use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hass_bridge::config::{ENV_TOKEN, ENV_URL};
use hass_bridge::logging::{self, LoggingMode, ENV_LOG_MODE};
use hass_bridge::{BridgeConfig, Gateway, ServiceTarget, Value};
use tracing::{error, info};

pub mod watch;

/// Home Assistant command line client
///
/// Connects to the hub named by `--url` or `HASS_URL` with the token from
/// `--token` or `HASS_TOKEN`, runs one command and exits.
#[derive(Parser, Debug)]
#[command(name = "hass-cli")]
#[command(about = "Talk to a Home Assistant hub over its WebSocket API")]
#[command(version)]
pub struct Args {
    /// Hub address, e.g. http://homeassistant.local:8123
    #[arg(long, global = true)]
    pub url: Option<String>,

    /// Long-lived access token
    #[arg(long, global = true)]
    pub token: Option<String>,

    /// Per-call timeout in seconds
    #[arg(short = 't', long, global = true)]
    pub timeout: Option<u64>,

    /// How long to wait for the connection, in seconds
    #[arg(long, global = true, default_value = "10")]
    pub connect_timeout: u64,

    /// Verbose diagnostics on stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
pub enum Command {
    /// Send a raw command object, e.g. '{"type": "get_config"}'
    Call { payload: String },

    /// Print entity states, or one entity's state
    States { entity: Option<String> },

    /// Call a service, e.g. `service light turn_on --entity light.kitchen`
    Service {
        domain: String,
        service: String,
        /// Target entity; repeat for several
        #[arg(short, long)]
        entity: Vec<String>,
        /// Service data as a JSON object
        #[arg(short, long)]
        data: Option<String>,
    },

    /// Turn an entity on, or off with --off
    Toggle {
        entity: String,
        #[arg(long)]
        off: bool,
    },

    /// List entities, optionally of one domain
    Entities {
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// List the entity domains present on the hub
    Kinds,

    /// List registered devices with their entities
    Devices {
        /// Print one device by id
        #[arg(long)]
        id: Option<String>,
    },

    /// Open the Zigbee network for pairing through zigbee2mqtt
    PermitJoin {
        #[arg(short, long)]
        seconds: Option<u32>,
    },

    /// Stream events until Ctrl+C
    Watch {
        /// Only events about this entity
        entity: Option<String>,
        /// Event kind to listen for
        #[arg(short, long, default_value = "state_changed")]
        kind: String,
        /// Stop after this many events
        #[arg(short = 'n', long)]
        count: Option<usize>,
    },

    /// Measure the round trip to the hub
    Ping,
}

impl Args {
    /// Validate command line arguments
    pub fn validate(&self) -> Result<()> {
        if self.timeout == Some(0) {
            return Err(anyhow::anyhow!("Timeout must be positive"));
        }
        if self.connect_timeout == 0 {
            return Err(anyhow::anyhow!("Connect timeout must be positive"));
        }
        if let Command::Watch { kind, count, .. } = &self.command {
            if kind.trim().is_empty() {
                return Err(anyhow::anyhow!("Event kind must not be empty"));
            }
            if *count == Some(0) {
                return Err(anyhow::anyhow!("Count must be at least 1"));
            }
        }
        Ok(())
    }

    /// Build the bridge config; flags take precedence over `HASS_*` variables
    pub fn bridge_config(&self) -> Result<BridgeConfig> {
        let url = self.url.clone();
        let token = self.token.clone();
        let lookup = move |key: &str| match key {
            ENV_URL => url.clone().or_else(|| std::env::var(key).ok()),
            ENV_TOKEN => token.clone().or_else(|| std::env::var(key).ok()),
            _ => std::env::var(key).ok(),
        };

        let mut config = BridgeConfig::from_lookup(lookup)?;
        if let Some(secs) = self.timeout {
            config = config.with_call_timeout(Duration::from_secs(secs));
        }
        Ok(config)
    }
}

/// Logging goes to stderr so command output stays pipeable
fn init_logging(verbose: bool) -> Result<()> {
    if std::env::var(ENV_LOG_MODE).is_ok() {
        logging::init_logging_from_env()?;
    } else if verbose {
        logging::init_logging(LoggingMode::Debug)?;
    } else {
        logging::init_logging(LoggingMode::Silent)?;
    }
    Ok(())
}

fn print_json(value: &impl serde::Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn parse_json_object(raw: &str, what: &str) -> Result<Value> {
    let value: Value =
        serde_json::from_str(raw).with_context(|| format!("{} is not valid JSON", what))?;
    if !value.is_object() {
        return Err(anyhow::anyhow!("{} must be a JSON object", what));
    }
    Ok(value)
}

async fn run(gateway: &Gateway, command: Command) -> Result<()> {
    match command {
        Command::Call { payload } => {
            let payload = parse_json_object(&payload, "Payload")?;
            print_json(&gateway.call_raw(payload, None).await?)
        }
        Command::States { entity: Some(entity) } => match gateway.get_state(entity.as_str()).await? {
            Some(state) => print_json(&state),
            None => Err(anyhow::anyhow!("Hub has no entity {}", entity)),
        },
        Command::States { entity: None } => print_json(&gateway.get_states().await?),
        Command::Service {
            domain,
            service,
            entity,
            data,
        } => {
            let data = data
                .as_deref()
                .map(|raw| parse_json_object(raw, "Service data"))
                .transpose()?;
            let target = (!entity.is_empty()).then(|| ServiceTarget {
                entity_id: entity.into_iter().map(Into::into).collect(),
                ..Default::default()
            });
            print_json(&gateway.call_service(&domain, &service, data, target).await?)
        }
        Command::Toggle { entity, off } => {
            gateway.toggle_entity(entity.as_str(), !off).await?;
            println!("{} turned {}", entity, if off { "off" } else { "on" });
            Ok(())
        }
        Command::Entities { kind } => print_json(&gateway.entities(kind.as_deref()).await?),
        Command::Kinds => {
            for kind in gateway.entity_kinds().await? {
                println!("{}", kind);
            }
            Ok(())
        }
        Command::Devices { id: Some(id) } => match gateway.device(&id).await? {
            Some(device) => print_json(&device),
            None => Err(anyhow::anyhow!("Hub has no device {}", id)),
        },
        Command::Devices { id: None } => {
            for device in gateway.devices().await? {
                println!(
                    "{:<34} {:<32} {} entities",
                    device.id,
                    device.display_name(),
                    device.entities.len()
                );
            }
            Ok(())
        }
        Command::PermitJoin { seconds } => {
            gateway.permit_join(seconds).await?;
            match seconds {
                Some(seconds) => println!("Pairing open for {}s", seconds),
                None => println!("Pairing open"),
            }
            Ok(())
        }
        Command::Watch {
            entity,
            kind,
            count,
        } => watch::watch_events(gateway, &kind, entity.as_deref(), count).await,
        Command::Ping => {
            let rtt = gateway.ping().await?;
            println!("pong in {:.1} ms", rtt.as_secs_f64() * 1000.0);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    args.validate()?;
    init_logging(args.verbose).context("Failed to initialize logging")?;

    let config = args.bridge_config().context("Failed to load configuration")?;
    info!(hub = %config.session.hub_url, "Connecting");

    let gateway = Gateway::start(config).context("Failed to start the bridge")?;
    gateway
        .wait_ready(Duration::from_secs(args.connect_timeout))
        .await
        .context("Hub did not accept the connection")?;

    let outcome = run(&gateway, args.command).await;
    gateway.shutdown().await;

    if let Err(e) = &outcome {
        error!(error = %e, "Command failed");
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use rstest::rstest;

    #[test]
    fn test_cli_definition() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_parse_service() {
        let args = Args::try_parse_from([
            "hass-cli",
            "service",
            "light",
            "turn_on",
            "-e",
            "light.kitchen",
            "-e",
            "light.hall",
            "--data",
            r#"{"brightness": 80}"#,
            "--timeout",
            "3",
        ])
        .unwrap();

        assert_eq!(args.timeout, Some(3));
        assert_eq!(
            args.command,
            Command::Service {
                domain: "light".into(),
                service: "turn_on".into(),
                entity: vec!["light.kitchen".into(), "light.hall".into()],
                data: Some(r#"{"brightness": 80}"#.into()),
            }
        );
    }

    #[rstest]
    #[case(&["hass-cli", "--timeout", "0", "ping"])]
    #[case(&["hass-cli", "--connect-timeout", "0", "ping"])]
    #[case(&["hass-cli", "watch", "--kind", " "])]
    #[case(&["hass-cli", "watch", "-n", "0"])]
    fn test_invalid_arguments(#[case] argv: &[&str]) {
        let args = Args::try_parse_from(argv.iter().copied()).unwrap();
        assert!(args.validate().is_err());
    }

    #[test]
    fn test_flags_override_environment() {
        let args = Args::try_parse_from([
            "hass-cli",
            "--url",
            "http://hub.local:8123",
            "--token",
            "abc",
            "--timeout",
            "4",
            "kinds",
        ])
        .unwrap();

        let config = args.bridge_config().unwrap();
        assert_eq!(
            config.session.hub_url.as_str(),
            "ws://hub.local:8123/api/websocket"
        );
        assert_eq!(config.call_timeout, Duration::from_secs(4));
    }

    #[rstest]
    #[case(r#"{"type": "get_config"}"#, true)]
    #[case(r#"["get_config"]"#, false)]
    #[case("not json", false)]
    fn test_parse_json_object(#[case] raw: &str, #[case] ok: bool) {
        assert_eq!(parse_json_object(raw, "Payload").is_ok(), ok);
    }
}
