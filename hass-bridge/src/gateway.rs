//! Gateway - the entry point for bridge users
//!
//! Composes one session, a request multiplexer and an event router, and
//! is the only type REST handlers or a client-facing push channel need.

use std::sync::Arc;
use std::time::{Duration, Instant};

use hass_events::{EventHandler, EventRouter, RouterStats, SubjectFilter, SubscriptionGuard, SubscriptionId};
use hass_protocol::{EventKind, HubRequest, ServiceTarget, SubjectId, Value};
use hass_session::{CloseReason, LifecycleEvent, Session, SessionState, SessionStats};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BridgeConfig;
use crate::demux::BridgeSink;
use crate::devices::{self, DeviceSummary, EntitySummary};
use crate::error::{BridgeError, Result};
use crate::listener::{spawn_listen_worker, HubSubscriptions, ListenerChannels};
use crate::multiplexer::{MultiplexerStats, RequestMultiplexer};

/// Snapshot of every component's counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub session: SessionStats,
    pub requests: MultiplexerStats,
    pub events: RouterStats,
}

/// Facade over one hub connection
///
/// # Example
///
/// ```rust,ignore
/// use hass_bridge::{BridgeConfig, Gateway};
/// use hass_protocol::{EventFrame, EventKind};
///
/// let gateway = Gateway::start(BridgeConfig::from_env()?)?;
///
/// let states = gateway.get_states().await?;
/// gateway.toggle_entity("light.kitchen", true).await?;
///
/// let _guard = gateway.subscribe_scoped(
///     EventKind::StateChanged,
///     "light.kitchen",
///     |event: &EventFrame| -> hass_events::HandlerResult {
///         println!("now {:?}", event.new_state_value());
///         Ok(())
///     },
/// );
/// ```
pub struct Gateway {
    config: Arc<BridgeConfig>,
    session: Arc<Session>,
    multiplexer: Arc<RequestMultiplexer>,
    router: EventRouter,
    shutdown_tx: watch::Sender<bool>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Gateway {
    /// Build the bridge and start connecting
    ///
    /// Returns immediately; calls fail with `NotConnected` until the first
    /// connection is Ready. Must be called from within a tokio runtime.
    pub fn start(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let session = Session::new(config.session.clone())?;
        let multiplexer = Arc::new(RequestMultiplexer::new(Arc::clone(&session)));

        let (listen_tx, listen_rx) = mpsc::unbounded_channel();
        let router = EventRouter::with_listener(listen_tx)?;

        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub_subscriptions = HubSubscriptions::default();

        let listener = spawn_listen_worker(
            Arc::clone(&multiplexer),
            config.listen_kinds.clone(),
            config.call_timeout,
            hub_subscriptions.clone(),
            ListenerChannels {
                commands: listen_rx,
                ready: ready_rx,
                shutdown: shutdown_rx,
            },
        );

        let sink = BridgeSink {
            multiplexer: Arc::clone(&multiplexer),
            router: router.clone(),
            hub_subscriptions,
            ready_tx,
        };
        session.start(Arc::new(sink))?;

        info!(hub = %config.session.hub_url, "Gateway started");

        Ok(Self {
            config,
            session,
            multiplexer,
            router,
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
        })
    }

    /// Send a request and wait for the hub's reply
    ///
    /// `timeout` defaults to the configured call timeout. Fails at once with
    /// [`BridgeError::BridgeUnavailable`] while degraded and with
    /// [`BridgeError::NotConnected`] while no connection is Ready.
    pub async fn call(&self, request: HubRequest, timeout: Option<Duration>) -> Result<Value> {
        if let Some(reason) = self.degraded_reason() {
            return Err(BridgeError::BridgeUnavailable(reason));
        }
        if self.session.state().is_closed() {
            return Err(BridgeError::NotConnected);
        }

        let timeout = timeout.unwrap_or(self.config.call_timeout);
        self.multiplexer.call(request, timeout).await
    }

    /// Send an opaque command object, e.g. `{"type": "get_config"}`
    ///
    /// Any `id` in the payload is replaced by the bridge's own.
    pub async fn call_raw(&self, payload: Value, timeout: Option<Duration>) -> Result<Value> {
        let request = HubRequest::custom(payload)?;
        self.call(request, timeout).await
    }

    /// Register an event handler; see [`EventRouter::subscribe`]
    pub fn subscribe<H: EventHandler>(
        &self,
        kind: impl Into<EventKind>,
        subject: impl Into<SubjectFilter>,
        handler: H,
    ) -> SubscriptionId {
        self.router.subscribe(kind, subject, handler)
    }

    /// Register an event handler that is removed when the guard drops
    pub fn subscribe_scoped<H: EventHandler>(
        &self,
        kind: impl Into<EventKind>,
        subject: impl Into<SubjectFilter>,
        handler: H,
    ) -> SubscriptionGuard {
        self.router.subscribe_scoped(kind, subject, handler)
    }

    /// Remove a subscription. Removing one twice is a no-op.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.router.unsubscribe(id)
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.session.state_watch()
    }

    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.session.lifecycle_events()
    }

    /// Wait until the session is Ready
    ///
    /// Fails with `BridgeUnavailable` if the hub rejects the token first,
    /// and with `Timeout` if `within` passes.
    pub async fn wait_ready(&self, within: Duration) -> Result<()> {
        let mut state = self.session.state_watch();
        let outcome = tokio::time::timeout(within, async {
            loop {
                let current = *state.borrow_and_update();
                if current.is_ready() {
                    return Ok(());
                }
                if let Some(reason) = self.degraded_reason() {
                    return Err(BridgeError::BridgeUnavailable(reason));
                }
                if current.is_closed() {
                    return Err(BridgeError::NotConnected);
                }
                if state.changed().await.is_err() {
                    return Err(BridgeError::NotConnected);
                }
            }
        })
        .await;

        outcome.unwrap_or(Err(BridgeError::Timeout(within)))
    }

    /// Whether an authentication failure has disabled the bridge
    pub fn is_degraded(&self) -> bool {
        self.degraded_reason().is_some()
    }

    /// The hub's rejection message while degraded
    pub fn degraded_reason(&self) -> Option<String> {
        match self.session.close_reason() {
            Some(CloseReason::AuthenticationRejected(reason)) => Some(reason),
            _ => None,
        }
    }

    /// Operator-triggered recovery from the degraded state
    ///
    /// Reconnects with the current configuration; the degraded mark clears
    /// once the session leaves Closed. Does nothing if the session is still
    /// running.
    pub fn restart(&self) -> Result<()> {
        if !self.session.state().is_closed() {
            debug!(state = %self.session.state(), "Restart ignored, session still running");
            return Ok(());
        }

        if let Some(reason) = self.degraded_reason() {
            info!(previous = %reason, "Leaving degraded state");
        }
        self.session.restart()?;
        Ok(())
    }

    /// Close the connection and stop background work
    ///
    /// In-flight calls fail with `ConnectionLost`.
    pub async fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.session.close().await;
        self.multiplexer.fail_all(BridgeError::ConnectionLost);

        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            if let Err(e) = listener.await {
                warn!(error = %e, "Listen worker ended abnormally");
            }
        }
        info!("Gateway shut down");
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            session: self.session.stats(),
            requests: self.multiplexer.stats(),
            events: self.router.stats(),
        }
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    // Typed conveniences over `call`

    /// Current state object of every entity
    pub async fn get_states(&self) -> Result<Vec<Value>> {
        match self.call(HubRequest::GetStates, None).await? {
            Value::Array(states) => Ok(states),
            other => Err(BridgeError::ProtocolViolation(format!(
                "get_states returned {}",
                value_kind(&other)
            ))),
        }
    }

    /// Current state object of one entity, if the hub knows it
    pub async fn get_state(&self, entity_id: impl Into<SubjectId>) -> Result<Option<Value>> {
        let entity_id = entity_id.into();
        Ok(self
            .get_states()
            .await?
            .into_iter()
            .find(|state| state.get("entity_id").and_then(Value::as_str) == Some(entity_id.as_str())))
    }

    /// Call `domain.service`
    pub async fn call_service(
        &self,
        domain: &str,
        service: &str,
        service_data: Option<Value>,
        target: Option<ServiceTarget>,
    ) -> Result<Value> {
        let request = HubRequest::CallService {
            domain: domain.to_string(),
            service: service.to_string(),
            service_data,
            target,
        };
        self.call(request, None).await
    }

    /// Call a service of the entity's own domain on that entity, e.g.
    /// `light.turn_on` for `light.kitchen`
    pub async fn update_entity_state(
        &self,
        entity_id: impl Into<SubjectId>,
        service: &str,
        service_data: Option<Value>,
    ) -> Result<Value> {
        let entity_id = entity_id.into();
        let domain = entity_id
            .domain()
            .ok_or_else(|| {
                BridgeError::Configuration(format!("{} is not a domain.object_id entity id", entity_id))
            })?
            .to_string();
        self.call_service(&domain, service, service_data, Some(ServiceTarget::entity(entity_id)))
            .await
    }

    /// Turn an entity on or off through `homeassistant.turn_on/turn_off`
    pub async fn toggle_entity(&self, entity_id: impl Into<SubjectId>, enable: bool) -> Result<Value> {
        let service = if enable { "turn_on" } else { "turn_off" };
        self.call_service(
            "homeassistant",
            service,
            None,
            Some(ServiceTarget::entity(entity_id)),
        )
        .await
    }

    /// Entities with their current state, optionally of one domain
    pub async fn entities(&self, kind: Option<&str>) -> Result<Vec<EntitySummary>> {
        let (registry, states) = tokio::try_join!(
            self.call(HubRequest::EntityRegistryList, None),
            self.call(HubRequest::GetStates, None),
        )?;

        let mut entities = devices::assemble_entities(registry, states)?;
        if let Some(kind) = kind {
            entities.retain(|e| e.kind == kind);
        }
        Ok(entities)
    }

    /// One entity with its current state
    pub async fn entity(&self, entity_id: impl Into<SubjectId>) -> Result<Option<EntitySummary>> {
        let entity_id = entity_id.into();
        Ok(self
            .entities(None)
            .await?
            .into_iter()
            .find(|e| e.entity_id == entity_id))
    }

    /// Distinct entity domains, sorted
    pub async fn entity_kinds(&self) -> Result<Vec<String>> {
        Ok(devices::entity_kinds(&self.entities(None).await?))
    }

    /// Registered devices with their entities and states
    pub async fn devices(&self) -> Result<Vec<DeviceSummary>> {
        let (device_registry, entity_registry, states) = tokio::try_join!(
            self.call(HubRequest::DeviceRegistryList, None),
            self.call(HubRequest::EntityRegistryList, None),
            self.call(HubRequest::GetStates, None),
        )?;
        devices::assemble_devices(device_registry, entity_registry, states)
    }

    /// One registered device
    pub async fn device(&self, id: &str) -> Result<Option<DeviceSummary>> {
        Ok(self.devices().await?.into_iter().find(|d| d.id == id))
    }

    /// Open the Zigbee network for pairing via zigbee2mqtt
    pub async fn permit_join(&self, seconds: Option<u32>) -> Result<Value> {
        self.call_service("mqtt", "publish", Some(devices::permit_join_data(seconds)), None)
            .await
    }

    /// Round trip time of a `ping`
    pub async fn ping(&self) -> Result<Duration> {
        let started = Instant::now();
        self.call(HubRequest::Ping, None).await?;
        Ok(started.elapsed())
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
        self.session.shutdown();
    }
}

fn value_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
