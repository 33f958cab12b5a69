//! Upstream listen worker
//!
//! The hub only pushes events of a kind after a `subscribe_events` on the
//! current connection, and forgets those subscriptions when the connection
//! drops. This worker owns that bookkeeping: it turns the router's
//! `ListenCommand`s into `subscribe_events` / `unsubscribe_events` calls and
//! replays every wanted kind after each reconnect.
//!
//! The worker is the only writer of [`HubSubscriptions`]; the frame sink
//! reads it to drop events that arrive on an id the bridge no longer uses.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use hass_events::ListenCommand;
use hass_protocol::{EventKind, HubRequest};
use parking_lot::RwLock;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::BridgeError;
use crate::multiplexer::RequestMultiplexer;

/// Hub subscription id per kind on the current connection
///
/// An id is recorded before its `subscribe_events` is sent, so events that
/// race ahead of the reply are still accepted.
#[derive(Clone, Default)]
pub(crate) struct HubSubscriptions {
    ids: Arc<RwLock<HashMap<EventKind, u64>>>,
}

impl HubSubscriptions {
    /// Whether an event of `kind` on hub subscription `id` should be routed
    pub fn accepts(&self, kind: &EventKind, id: u64) -> bool {
        self.ids.read().get(kind) == Some(&id)
    }

    fn get(&self, kind: &EventKind) -> Option<u64> {
        self.ids.read().get(kind).copied()
    }

    fn insert(&self, kind: EventKind, id: u64) {
        self.ids.write().insert(kind, id);
    }

    fn remove(&self, kind: &EventKind) {
        self.ids.write().remove(kind);
    }

    fn clear(&self) {
        self.ids.write().clear();
    }
}

/// Inputs to the listen worker
pub(crate) struct ListenerChannels {
    /// Start/stop requests from the router
    pub commands: mpsc::UnboundedReceiver<ListenCommand>,
    /// One message per transition into Ready
    pub ready: mpsc::UnboundedReceiver<()>,
    pub shutdown: watch::Receiver<bool>,
}

struct ListenWorker {
    multiplexer: Arc<RequestMultiplexer>,
    timeout: Duration,
    /// Kinds listened to regardless of local subscribers
    pinned: HashSet<EventKind>,
    /// Kinds that should be subscribed on the hub
    wanted: HashSet<EventKind>,
    hub_ids: HubSubscriptions,
}

pub(crate) fn spawn_listen_worker(
    multiplexer: Arc<RequestMultiplexer>,
    pinned: Vec<EventKind>,
    timeout: Duration,
    hub_ids: HubSubscriptions,
    channels: ListenerChannels,
) -> JoinHandle<()> {
    let pinned: HashSet<EventKind> = pinned.into_iter().collect();
    let worker = ListenWorker {
        multiplexer,
        timeout,
        wanted: pinned.clone(),
        pinned,
        hub_ids,
    };
    tokio::spawn(worker.run(channels))
}

impl ListenWorker {
    async fn run(mut self, mut channels: ListenerChannels) {
        debug!(pinned = self.pinned.len(), "Listen worker started");

        loop {
            // A pending replay goes before new commands so a kind is not
            // subscribed twice on the same connection
            tokio::select! {
                biased;

                _ = shutdown_requested(&mut channels.shutdown) => break,

                ready = channels.ready.recv() => match ready {
                    Some(()) => self.resubscribe().await,
                    None => break,
                },

                command = channels.commands.recv() => match command {
                    Some(ListenCommand::Start(kind)) => self.start(kind).await,
                    Some(ListenCommand::Stop(kind)) => self.stop(kind).await,
                    None => break,
                },
            }
        }

        debug!("Listen worker stopped");
    }

    async fn start(&mut self, kind: EventKind) {
        self.wanted.insert(kind.clone());
        self.subscribe(kind).await;
    }

    async fn stop(&mut self, kind: EventKind) {
        if self.pinned.contains(&kind) {
            debug!(kind = %kind, "Keeping pinned kind subscribed on hub");
            return;
        }
        self.wanted.remove(&kind);

        let Some(subscription) = self.hub_ids.get(&kind) else {
            return;
        };
        // Until the hub confirms, the subscription may still be live; keeping
        // the id lets a later Start reuse it instead of opening a second one
        match self
            .multiplexer
            .call(HubRequest::UnsubscribeEvents { subscription }, self.timeout)
            .await
        {
            Ok(_) => {
                self.hub_ids.remove(&kind);
                info!(kind = %kind, subscription, "Stopped listening on hub");
            }
            Err(e) => warn!(
                kind = %kind,
                subscription,
                error = %e,
                "unsubscribe_events failed, keeping hub subscription"
            ),
        }
    }

    /// Replay every wanted kind on a fresh connection
    async fn resubscribe(&mut self) {
        self.hub_ids.clear();

        let mut kinds: Vec<EventKind> = self.wanted.iter().cloned().collect();
        kinds.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        debug!(count = kinds.len(), "Reissuing hub subscriptions");

        for kind in kinds {
            self.subscribe(kind).await;
        }
    }

    async fn subscribe(&mut self, kind: EventKind) {
        if self.hub_ids.get(&kind).is_some() {
            return;
        }

        let id = self.multiplexer.next_id();
        self.hub_ids.insert(kind.clone(), id);
        let request = HubRequest::SubscribeEvents {
            event_type: Some(kind.clone()),
        };
        match self.multiplexer.call_with_id(id, request, self.timeout).await {
            Ok(_) => info!(kind = %kind, subscription = id, "Listening on hub"),
            // The hub may have accepted it; events on this id are still routed
            Err(BridgeError::Timeout(_)) => {
                warn!(kind = %kind, subscription = id, "subscribe_events timed out, keeping id");
            }
            // The next Ready replays it
            Err(BridgeError::NotConnected) | Err(BridgeError::ConnectionLost) => {
                self.hub_ids.remove(&kind);
                debug!(kind = %kind, "Hub not ready, deferring subscribe_events");
            }
            Err(e) => {
                self.hub_ids.remove(&kind);
                warn!(kind = %kind, error = %e, "subscribe_events failed");
            }
        }
    }
}

async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
