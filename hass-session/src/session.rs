//! Hub session
//!
//! A `Session` owns the one live connection to the hub. A single worker
//! task does everything that touches the socket: connecting, the auth
//! handshake, reading frames, writing queued frames, liveness pings and
//! the reconnect backoff. Everyone else talks to the worker through two
//! narrow doors: [`Session::send`] enqueues a frame, and the registered
//! [`FrameSink`] receives every decoded frame and state transition.
//!
//! # Lifecycle
//!
//! - `Session::new()` validates the config; nothing connects yet
//! - `start()` spawns the worker, which loops connect → authenticate →
//!   serve → back off until `shutdown()` or the hub rejects the token
//! - A rejected token ends in `Closed` and the worker exits; only an
//!   explicit `restart()` tries again

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures_util::{SinkExt, StreamExt};
use hass_protocol::{decode_message, HubRequest, InboundFrame, OutgoingFrame, ProtocolError};
use parking_lot::{Mutex, RwLock};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing::{debug, error, info, warn};

use crate::backoff::Backoff;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::sink::FrameSink;
use crate::state::{CloseReason, LifecycleEvent, SessionState, SessionStats};
use crate::transport::Transport;

/// Buffered lifecycle events for `lifecycle_events()` subscribers
const LIFECYCLE_BUFFER: usize = 64;

/// Session-owned ping ids remembered so late pongs are not forwarded
const OWN_PING_MEMORY: usize = 8;

/// Why `serve` returned
enum Disconnect {
    Shutdown,
    Lost(String),
}

/// The single persistent connection to the hub
pub struct Session {
    config: Arc<SessionConfig>,

    /// Current state; readable without touching the worker
    state_tx: watch::Sender<SessionState>,

    /// Every transition, for observers that need more than the latest state
    lifecycle_tx: broadcast::Sender<LifecycleEvent>,

    /// Queue into the worker's writer; `Some` only while Ready
    outbox: Mutex<Option<mpsc::UnboundedSender<String>>>,

    /// Correlation id counter, shared by callers and liveness pings
    next_id: AtomicU64,

    /// Consumer of inbound frames and transitions
    sink: RwLock<Option<Arc<dyn FrameSink>>>,

    /// Set to true to stop the worker
    shutdown_tx: watch::Sender<bool>,

    /// Worker task handle
    task: Mutex<Option<JoinHandle<()>>>,

    /// Why the session is Closed; `None` in every other state
    close_reason: Mutex<Option<CloseReason>>,

    stats: Mutex<SessionStats>,
}

impl Session {
    /// Create a session. Does not connect; call [`Session::start`].
    pub fn new(config: SessionConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        let (lifecycle_tx, _) = broadcast::channel(LIFECYCLE_BUFFER);
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Arc::new(Self {
            config: Arc::new(config),
            state_tx,
            lifecycle_tx,
            outbox: Mutex::new(None),
            next_id: AtomicU64::new(1),
            sink: RwLock::new(None),
            shutdown_tx,
            task: Mutex::new(None),
            close_reason: Mutex::new(None),
            stats: Mutex::new(SessionStats::default()),
        }))
    }

    /// Register the frame sink and spawn the connection worker.
    ///
    /// Calling `start` while the worker is running only replaces the sink.
    pub fn start(self: &Arc<Self>, sink: Arc<dyn FrameSink>) -> Result<()> {
        *self.sink.write() = Some(sink);
        self.spawn_worker()
    }

    /// Start again after the session reached `Closed`.
    ///
    /// This is the operator path out of an authentication rejection. Does
    /// nothing if the worker is still running.
    pub fn restart(self: &Arc<Self>) -> Result<()> {
        if self.sink.read().is_none() {
            return Err(SessionError::Configuration(
                "Session was never started".to_string(),
            ));
        }
        info!("Restarting session");
        self.spawn_worker()
    }

    fn spawn_worker(self: &Arc<Self>) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| SessionError::NoRuntime)?;

        let mut task = self.task.lock();
        // A worker that already published Closed only has its return left
        let running = task.as_ref().is_some_and(|t| !t.is_finished());
        if running && !self.state().is_closed() {
            debug!("Session worker already running");
            return Ok(());
        }

        self.shutdown_tx.send_replace(false);
        let session = Arc::clone(self);
        *task = Some(runtime.spawn(async move { session.run().await }));
        Ok(())
    }

    /// Ask the worker to close the connection and stop.
    ///
    /// Returns immediately; the session reaches `Closed` shortly after.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);

        let running = self.task.lock().as_ref().is_some_and(|t| !t.is_finished());
        if !running {
            self.transition_with(
                SessionState::Closed,
                Some("shutdown requested".to_string()),
                Some(CloseReason::Shutdown),
            );
        }
    }

    /// Shut down and wait for the worker to exit.
    pub async fn close(&self) {
        self.shutdown();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Session worker ended abnormally");
            }
        }
    }

    /// Allocate the next correlation id.
    pub fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue a frame for the hub.
    ///
    /// Fails fast with [`SessionError::NotConnected`] unless the session is
    /// Ready; nothing is queued for later delivery.
    pub fn send(&self, frame: &OutgoingFrame) -> Result<()> {
        let text = frame.encode()?;

        let outbox = self.outbox.lock();
        let Some(tx) = outbox.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        if !self.state().is_ready() {
            return Err(SessionError::NotConnected);
        }

        tx.send(text).map_err(|_| SessionError::NotConnected)?;
        debug!(id = frame.id, kind = frame.request.kind(), "Queued frame");
        Ok(())
    }

    /// Current state
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Watch the current state
    pub fn state_watch(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Receive every state transition from now on
    pub fn lifecycle_events(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.lifecycle_tx.subscribe()
    }

    /// Snapshot of the session counters
    pub fn stats(&self) -> SessionStats {
        self.stats.lock().clone()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Why the session is Closed, or `None` while it is not
    ///
    /// Set before the Closed state becomes visible to watchers.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.lock().clone()
    }

    fn transition(&self, to: SessionState, reason: Option<String>) {
        self.transition_with(to, reason, None);
    }

    fn transition_with(
        &self,
        to: SessionState,
        reason: Option<String>,
        close_reason: Option<CloseReason>,
    ) {
        // Closing the outbox first makes `send` fail fast from this point on
        if !to.is_ready() {
            self.outbox.lock().take();
        }

        {
            let mut last = self.close_reason.lock();
            if !to.is_closed() {
                *last = None;
            } else if !self.state().is_closed() {
                *last = close_reason.clone();
            }
        }

        let from = self.state_tx.send_replace(to);
        if from == to {
            return;
        }

        if to == SessionState::Reconnecting {
            self.stats.lock().reconnects += 1;
        }

        let mut event = LifecycleEvent::new(from, to, reason);
        event.close_reason = close_reason;

        info!(
            from = %from,
            to = %to,
            reason = event.reason.as_deref().unwrap_or(""),
            "Session state changed"
        );

        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_lifecycle(&event);
        }
        let _ = self.lifecycle_tx.send(event);
    }

    fn deliver(&self, frame: InboundFrame) {
        let sink = self.sink.read().clone();
        match sink {
            Some(sink) => sink.on_frame(frame),
            None => debug!(frame = ?frame, "No frame sink registered, dropping frame"),
        }
    }

    fn report_violation(&self, error: &ProtocolError) {
        let sink = self.sink.read().clone();
        if let Some(sink) = sink {
            sink.on_protocol_violation(error);
        }
    }

    /// Main worker loop
    async fn run(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut backoff = Backoff::new(self.config.reconnect_min, self.config.reconnect_max);

        info!(hub = %self.config.hub_url, "Session worker started");

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            self.transition(SessionState::Connecting, None);

            let connected = tokio::select! {
                result = Transport::connect(&self.config.hub_url) => result,
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            };

            match connected {
                Ok(mut transport) => {
                    self.transition(SessionState::Authenticating, None);

                    let verdict = tokio::select! {
                        result = transport.authenticate(
                            &self.config.access_token,
                            self.config.auth_timeout,
                        ) => result,
                        _ = wait_for_shutdown(&mut shutdown_rx) => break,
                    };

                    match verdict {
                        Ok(version) => {
                            info!(hub_version = ?version, "Authenticated with hub");
                            self.stats.lock().hub_version = version;

                            let ready_at = Instant::now();
                            match self.serve(transport, &mut shutdown_rx).await {
                                Disconnect::Shutdown => break,
                                Disconnect::Lost(reason) => {
                                    if ready_at.elapsed() >= self.config.backoff_reset_after {
                                        backoff.reset();
                                    }
                                    warn!(reason = %reason, "Connection to hub lost");
                                    self.transition(SessionState::Reconnecting, Some(reason));
                                }
                            }
                        }
                        Err(SessionError::AuthenticationFailed(message)) => {
                            error!(message = %message, "Hub rejected access token, session closed");
                            self.transition_with(
                                SessionState::Closed,
                                Some(message.clone()),
                                Some(CloseReason::AuthenticationRejected(message)),
                            );
                            return;
                        }
                        Err(e) => {
                            warn!(error = %e, "Auth handshake failed");
                            self.transition(SessionState::Reconnecting, Some(e.to_string()));
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "Failed to connect to hub");
                    self.transition(SessionState::Reconnecting, Some(e.to_string()));
                }
            }

            let delay = backoff.next_delay();
            debug!(
                delay_ms = delay.as_millis() as u64,
                attempt = backoff.attempts(),
                "Waiting before reconnect"
            );

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = wait_for_shutdown(&mut shutdown_rx) => break,
            }
        }

        self.transition_with(
            SessionState::Closed,
            Some("shutdown requested".to_string()),
            Some(CloseReason::Shutdown),
        );
        info!("Session worker stopped");
    }

    /// Pump frames on an authenticated connection until it dies or shutdown
    async fn serve(
        &self,
        transport: Transport,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Disconnect {
        let (tx, mut outbox_rx) = mpsc::unbounded_channel::<String>();
        *self.outbox.lock() = Some(tx);
        self.transition(SessionState::Ready, None);

        let (mut ws_sink, mut ws_stream) = transport.split();
        let mut last_rx = Instant::now();
        let mut ping: Option<(u64, Instant)> = None;
        let mut own_pings: VecDeque<u64> = VecDeque::with_capacity(OWN_PING_MEMORY);
        let mut violations: u32 = 0;

        let mut tick = tokio::time::interval(self.liveness_tick());
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown_rx) => {
                    let _ = ws_sink.send(Message::Close(None)).await;
                    return Disconnect::Shutdown;
                }

                outgoing = outbox_rx.recv() => match outgoing {
                    Some(text) => {
                        if let Err(e) = ws_sink.send(Message::Text(text)).await {
                            return Disconnect::Lost(format!("Failed to send: {}", e));
                        }
                    }
                    None => return Disconnect::Lost("Outbox closed".to_string()),
                },

                incoming = ws_stream.next() => match incoming {
                    Some(Ok(Message::Text(text))) => {
                        last_rx = Instant::now();
                        if let Some(reason) = self.handle_text(&text, &mut own_pings, &mut ping, &mut violations) {
                            return Disconnect::Lost(reason);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_rx = Instant::now();
                        let error = ProtocolError::InvalidFrame {
                            frame_type: "<binary>".to_string(),
                            reason: "binary messages are not part of the protocol".to_string(),
                        };
                        if let Some(reason) = self.record_violation(&error, &mut violations) {
                            return Disconnect::Lost(reason);
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Disconnect::Lost(format!("Hub closed connection: {:?}", frame));
                    }
                    Some(Ok(_)) => {
                        // Control frames still prove the hub is alive
                        last_rx = Instant::now();
                    }
                    Some(Err(e)) => return Disconnect::Lost(format!("WebSocket error: {}", e)),
                    None => return Disconnect::Lost("Connection closed by hub".to_string()),
                },

                _ = tick.tick() => {
                    match ping {
                        Some((id, sent_at)) if last_rx < sent_at => {
                            if sent_at.elapsed() >= self.config.liveness_timeout {
                                return Disconnect::Lost(format!(
                                    "No answer to liveness ping {} within {:?}",
                                    id, self.config.liveness_timeout
                                ));
                            }
                        }
                        _ => {
                            if last_rx.elapsed() >= self.config.liveness_interval {
                                let id = self.next_id();
                                let text = match OutgoingFrame::new(id, HubRequest::Ping).encode() {
                                    Ok(text) => text,
                                    Err(e) => return Disconnect::Lost(e.to_string()),
                                };
                                if let Err(e) = ws_sink.send(Message::Text(text)).await {
                                    return Disconnect::Lost(format!("Failed to send ping: {}", e));
                                }
                                debug!(id, "Sent liveness ping");
                                if own_pings.len() == OWN_PING_MEMORY {
                                    own_pings.pop_front();
                                }
                                own_pings.push_back(id);
                                ping = Some((id, Instant::now()));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Decode and dispatch one text message. Returns a reason when the
    /// connection should be dropped.
    fn handle_text(
        &self,
        text: &str,
        own_pings: &mut VecDeque<u64>,
        ping: &mut Option<(u64, Instant)>,
        violations: &mut u32,
    ) -> Option<String> {
        let frames = decode_message(text);
        {
            let mut stats = self.stats.lock();
            stats.frames_received += frames.len() as u64;
            stats.last_activity = Some(Utc::now());
        }

        for decoded in frames {
            match decoded {
                Ok(InboundFrame::Pong { id }) if own_pings.contains(&id) => {
                    own_pings.retain(|p| *p != id);
                    if ping.is_some_and(|(p, _)| p == id) {
                        *ping = None;
                    }
                    *violations = 0;
                    debug!(id, "Liveness pong received");
                }
                Ok(frame) => {
                    *violations = 0;
                    self.deliver(frame);
                }
                Err(error) => {
                    if let Some(reason) = self.record_violation(&error, violations) {
                        return Some(reason);
                    }
                }
            }
        }
        None
    }

    fn record_violation(&self, error: &ProtocolError, violations: &mut u32) -> Option<String> {
        *violations += 1;
        self.stats.lock().protocol_violations += 1;
        warn!(error = %error, consecutive = *violations, "Dropping malformed frame from hub");
        self.report_violation(error);

        if *violations > self.config.max_protocol_violations {
            Some(format!("{} consecutive protocol violations", violations))
        } else {
            None
        }
    }

    fn liveness_tick(&self) -> Duration {
        let shortest = self.config.liveness_interval.min(self.config.liveness_timeout);
        (shortest / 4).max(Duration::from_millis(10))
    }
}

async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        // Sender gone means the session is gone; nothing left to wait for
        std::future::pending::<()>().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hass_protocol::HubRequest;

    fn test_config() -> SessionConfig {
        SessionConfig::fast_reconnect().with_access_token("test-token")
    }

    #[test]
    fn test_new_validates_config() {
        assert!(Session::new(SessionConfig::default()).is_err());
        assert!(Session::new(test_config()).is_ok());
    }

    #[test]
    fn test_ids_are_monotonic() {
        let session = Session::new(test_config()).unwrap();
        let a = session.next_id();
        let b = session.next_id();
        let c = session.next_id();
        assert!(a < b && b < c);
    }

    #[test]
    fn test_send_fails_fast_when_not_ready() {
        let session = Session::new(test_config()).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        let frame = OutgoingFrame::new(session.next_id(), HubRequest::GetStates);
        assert!(matches!(session.send(&frame), Err(SessionError::NotConnected)));
    }

    #[test]
    fn test_shutdown_before_start_closes() {
        let session = Session::new(test_config()).unwrap();
        session.shutdown();
        assert_eq!(session.state(), SessionState::Closed);
        assert_eq!(session.close_reason(), Some(CloseReason::Shutdown));
    }

    #[test]
    fn test_start_requires_runtime() {
        struct NullSink;
        impl FrameSink for NullSink {
            fn on_frame(&self, _frame: InboundFrame) {}
            fn on_lifecycle(&self, _event: &LifecycleEvent) {}
        }

        let session = Session::new(test_config()).unwrap();
        assert!(matches!(
            session.start(Arc::new(NullSink)),
            Err(SessionError::NoRuntime)
        ));
    }

    #[test]
    fn test_restart_requires_prior_start() {
        let session = Session::new(test_config()).unwrap();
        assert!(matches!(
            session.restart(),
            Err(SessionError::Configuration(_))
        ));
    }
}
