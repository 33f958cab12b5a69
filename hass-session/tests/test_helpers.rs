//! Test helpers and a mock hub for integration testing.
//!
//! The mock hub speaks enough of the Home Assistant WebSocket API to drive
//! a session: the auth handshake, pong replies to pings, a pluggable
//! responder for everything else, and test-controlled pushes and
//! connection drops. Reply builders script the hub's answers to specific
//! commands.
//!
//! hass-bridge includes this file through `#[path]`, so it may only use
//! crates both test suites depend on.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hass_session::{LifecycleEvent, SessionState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tracing_subscriber::EnvFilter;

pub const TEST_TOKEN: &str = "test-token";
pub const HUB_VERSION: &str = "2024.6.0";

/// Route `tracing` output through the test harness, filtered by `RUST_LOG`
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Handle for sending frames back to the connected client
#[derive(Clone)]
pub struct HubLink {
    tx: mpsc::UnboundedSender<String>,
}

impl HubLink {
    pub fn send(&self, value: Value) {
        let _ = self.tx.send(value.to_string());
    }

    pub fn send_after(&self, delay: Duration, value: Value) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(value.to_string());
        });
    }
}

/// Decides how the hub answers a command. Pings never reach the responder.
pub type Responder = Arc<dyn Fn(&Value, &HubLink) + Send + Sync>;

/// Reply `success: true` with a null result to every command
pub fn default_responder() -> Responder {
    Arc::new(|request: &Value, link: &HubLink| {
        link.send(json!({
            "id": request["id"],
            "type": "result",
            "success": true,
            "result": null,
        }));
    })
}

/// Never reply
pub fn silent_responder() -> Responder {
    Arc::new(|_: &Value, _: &HubLink| {})
}

/// Answer each command with what `reply` returns for it; `None` means no answer
pub fn reply_with(reply: impl Fn(&Value) -> Option<Value> + Send + Sync + 'static) -> Responder {
    Arc::new(move |request: &Value, link: &HubLink| {
        if let Some(answer) = reply(request) {
            link.send(answer);
        }
    })
}

/// A successful `result` frame for `request`
pub fn ok_reply(request: &Value, result: Value) -> Value {
    json!({
        "id": request["id"],
        "type": "result",
        "success": true,
        "result": result,
    })
}

/// A failed `result` frame for `request`
pub fn error_reply(request: &Value, code: &str, message: &str) -> Value {
    json!({
        "id": request["id"],
        "type": "result",
        "success": false,
        "error": {"code": code, "message": message},
    })
}

#[derive(Clone, Debug)]
enum HubCommand {
    Push(String),
    DropConnections,
}

struct Shared {
    token: Mutex<String>,
    responder: Mutex<Responder>,
    answer_pings: AtomicBool,
    connections: AtomicUsize,
    authenticated: AtomicUsize,
    received: Mutex<Vec<Value>>,
    commands: broadcast::Sender<HubCommand>,
}

/// A mock Home Assistant hub on a random local port
pub struct MockHub {
    addr: SocketAddr,
    shared: Arc<Shared>,
    accept_task: JoinHandle<()>,
}

impl MockHub {
    pub async fn start() -> Self {
        init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (commands, _) = broadcast::channel(64);

        let shared = Arc::new(Shared {
            token: Mutex::new(TEST_TOKEN.to_string()),
            responder: Mutex::new(default_responder()),
            answer_pings: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            authenticated: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
            commands,
        });

        let accept_shared = Arc::clone(&shared);
        let accept_task = tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let shared = Arc::clone(&accept_shared);
                tokio::spawn(async move {
                    if let Err(e) = serve_connection(stream, shared).await {
                        eprintln!("Mock hub connection error: {}", e);
                    }
                });
            }
        });

        Self {
            addr,
            shared,
            accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}/api/websocket", self.addr)
    }

    pub fn set_token(&self, token: &str) {
        *self.shared.token.lock().unwrap() = token.to_string();
    }

    pub fn set_responder(&self, responder: Responder) {
        *self.shared.responder.lock().unwrap() = responder;
    }

    pub fn set_answer_pings(&self, answer: bool) {
        self.shared.answer_pings.store(answer, Ordering::SeqCst);
    }

    /// Send a frame to every authenticated connection
    pub fn push(&self, value: Value) {
        self.push_raw(value.to_string());
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.shared.commands.send(HubCommand::Push(text.into()));
    }

    /// Drop every connection without a close handshake
    pub fn drop_connections(&self) {
        let _ = self.shared.commands.send(HubCommand::DropConnections);
    }

    /// Stop accepting connections and drop the existing ones
    pub fn stop(&self) {
        self.accept_task.abort();
        self.drop_connections();
    }

    /// Connections accepted so far
    pub fn connections(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Connections that passed the auth handshake
    pub fn authenticated(&self) -> usize {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Every command received after authentication, pings included
    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().unwrap().clone()
    }

    pub fn received_of_type(&self, frame_type: &str) -> Vec<Value> {
        self.received()
            .into_iter()
            .filter(|v| v["type"] == frame_type)
            .collect()
    }
}

impl Drop for MockHub {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn serve_connection(
    stream: TcpStream,
    shared: Arc<Shared>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws = tokio_tungstenite::accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();
    let mut commands = shared.commands.subscribe();
    shared.connections.fetch_add(1, Ordering::SeqCst);

    sink.send(Message::Text(
        json!({"type": "auth_required", "ha_version": HUB_VERSION}).to_string(),
    ))
    .await?;

    let auth: Value = loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => break serde_json::from_str(&text)?,
            Some(Ok(_)) => continue,
            _ => return Ok(()),
        }
    };

    let expected = shared.token.lock().unwrap().clone();
    if auth["type"] != "auth" || auth["access_token"].as_str() != Some(expected.as_str()) {
        sink.send(Message::Text(
            json!({"type": "auth_invalid", "message": "Invalid access token or password"})
                .to_string(),
        ))
        .await?;
        let _ = sink.close().await;
        return Ok(());
    }

    sink.send(Message::Text(
        json!({"type": "auth_ok", "ha_version": HUB_VERSION}).to_string(),
    ))
    .await?;
    shared.authenticated.fetch_add(1, Ordering::SeqCst);

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
    let link = HubLink { tx: out_tx };

    loop {
        tokio::select! {
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let request: Value = serde_json::from_str(&text)?;
                    shared.received.lock().unwrap().push(request.clone());

                    if request["type"] == "ping" {
                        if shared.answer_pings.load(Ordering::SeqCst) {
                            link.send(json!({"id": request["id"], "type": "pong"}));
                        }
                        continue;
                    }

                    let responder = shared.responder.lock().unwrap().clone();
                    responder(&request, &link);
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return Ok(()),
                Some(Ok(_)) => {}
            },
            Some(text) = out_rx.recv() => {
                sink.send(Message::Text(text)).await?;
            }
            command = commands.recv() => match command {
                Ok(HubCommand::Push(text)) => sink.send(Message::Text(text)).await?,
                Ok(HubCommand::DropConnections) => return Ok(()),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => return Ok(()),
            },
        }
    }
}

/// Build a `state_changed` event frame as the hub sends it
pub fn state_changed_frame(subscription: u64, entity_id: &str, old: &str, new: &str) -> Value {
    json!({
        "id": subscription,
        "type": "event",
        "event": {
            "event_type": "state_changed",
            "data": {
                "entity_id": entity_id,
                "old_state": {"entity_id": entity_id, "state": old, "attributes": {}},
                "new_state": {"entity_id": entity_id, "state": new, "attributes": {}},
            },
            "origin": "LOCAL",
            "time_fired": "2024-06-01T12:00:00.000000+00:00",
        }
    })
}

/// Wait until a transition into `to` is observed
pub async fn wait_for_transition(
    events: &mut broadcast::Receiver<LifecycleEvent>,
    to: SessionState,
    within: Duration,
) -> Option<LifecycleEvent> {
    tokio::time::timeout(within, async {
        loop {
            match events.recv().await {
                Ok(event) if event.to == to => return Some(event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten()
}

/// Poll `condition` until it holds or `within` passes
pub async fn wait_until(within: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
