//! Event router
//!
//! Keeps the subscription table and fans inbound event frames out to
//! matching subscribers. Routing only pushes a shared frame onto each
//! subscriber's queue, so the session's reader never waits on a handler.
//!
//! Every subscription owns a dispatch task that drains its queue in order
//! and runs the handler on the blocking pool. A slow handler delays only
//! its own subscription; a failing or panicking one is logged and keeps
//! receiving events. Queues hold at most [`SUBSCRIPTION_QUEUE_CAPACITY`]
//! frames; a subscriber that falls further behind loses the newest frames,
//! which are counted in [`RouterStats::dropped_events`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use hass_protocol::{EventFrame, EventKind};
use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace, warn};

use crate::error::{Result, RouterError};
use crate::handler::EventHandler;
use crate::subscription::{SubjectFilter, SubscriptionGuard, SubscriptionId};

/// Frames queued per subscription before new ones are dropped
pub const SUBSCRIPTION_QUEUE_CAPACITY: usize = 1024;

/// Upstream listen requests emitted as subscriptions come and go
///
/// The first subscription for a kind emits `Start`; removing the last one
/// emits `Stop`. Commands are emitted in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenCommand {
    Start(EventKind),
    Stop(EventKind),
}

/// Point-in-time router counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub active_subscriptions: usize,
    /// Kinds with at least one subscription
    pub listened_kinds: usize,
    /// Frames passed to `route`
    pub routed_events: u64,
    /// Handler invocations, successful or not
    pub dispatched: u64,
    /// Handler invocations that returned an error or panicked
    pub handler_failures: u64,
    /// Frames not queued because a subscriber's queue was full
    pub dropped_events: u64,
}

#[derive(Default)]
struct Counters {
    routed: AtomicU64,
    dispatched: AtomicU64,
    failures: AtomicU64,
    dropped: AtomicU64,
}

struct Entry {
    kind: EventKind,
    filter: SubjectFilter,
    active: Arc<AtomicBool>,
    queue: mpsc::Sender<Arc<EventFrame>>,
    /// Set while the queue is full, so each overflow is logged once
    overflowing: AtomicBool,
}

#[derive(Default)]
struct Tables {
    entries: HashMap<SubscriptionId, Entry>,
    index: HashMap<EventKind, HashMap<SubjectFilter, Vec<SubscriptionId>>>,
    listen_refs: HashMap<EventKind, usize>,
}

pub(crate) struct RouterInner {
    tables: RwLock<Tables>,
    next_id: AtomicU64,
    runtime: Handle,
    listener: Option<mpsc::UnboundedSender<ListenCommand>>,
    counters: Arc<Counters>,
}

impl RouterInner {
    fn subscribe(
        &self,
        kind: EventKind,
        filter: SubjectFilter,
        handler: Arc<dyn EventHandler>,
    ) -> SubscriptionId {
        let id = SubscriptionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let active = Arc::new(AtomicBool::new(true));
        let (queue, queue_rx) = mpsc::channel(SUBSCRIPTION_QUEUE_CAPACITY);

        self.runtime.spawn(run_subscription(
            id,
            kind.clone(),
            handler,
            Arc::clone(&active),
            queue_rx,
            Arc::clone(&self.counters),
        ));

        let mut guard = self.tables.write();
        let tables = &mut *guard;
        tables
            .index
            .entry(kind.clone())
            .or_default()
            .entry(filter.clone())
            .or_default()
            .push(id);

        let count = tables.listen_refs.entry(kind.clone()).or_insert(0);
        *count += 1;
        debug!(
            subscription = %id,
            kind = %kind,
            subject = %filter,
            refs = *count,
            "Subscription added"
        );
        if *count == 1 {
            self.emit(ListenCommand::Start(kind.clone()));
        }

        tables.entries.insert(
            id,
            Entry {
                kind,
                filter,
                active,
                queue,
                overflowing: AtomicBool::new(false),
            },
        );
        id
    }

    pub(crate) fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut guard = self.tables.write();
        let tables = &mut *guard;
        let Some(entry) = tables.entries.remove(&id) else {
            trace!(subscription = %id, "Unsubscribe for unknown subscription ignored");
            return false;
        };
        entry.active.store(false, Ordering::Release);

        if let Some(by_filter) = tables.index.get_mut(&entry.kind) {
            if let Some(ids) = by_filter.get_mut(&entry.filter) {
                ids.retain(|other| *other != id);
                if ids.is_empty() {
                    by_filter.remove(&entry.filter);
                }
            }
            if by_filter.is_empty() {
                tables.index.remove(&entry.kind);
            }
        }

        let remaining = match tables.listen_refs.get_mut(&entry.kind) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count
            }
            None => 0,
        };
        debug!(
            subscription = %id,
            kind = %entry.kind,
            subject = %entry.filter,
            refs = remaining,
            "Subscription removed"
        );
        if remaining == 0 {
            tables.listen_refs.remove(&entry.kind);
            self.emit(ListenCommand::Stop(entry.kind.clone()));
        }

        // Dropping the entry closes the queue and ends its dispatch task
        true
    }

    fn route(&self, event: EventFrame) -> usize {
        self.counters.routed.fetch_add(1, Ordering::Relaxed);
        let event = Arc::new(event);

        let tables = self.tables.read();
        let Some(by_filter) = tables.index.get(&event.kind) else {
            trace!(kind = %event.kind, "No subscribers for event");
            return 0;
        };

        let exact = event
            .subject
            .as_ref()
            .and_then(|subject| by_filter.get(&SubjectFilter::Entity(subject.clone())));
        let wildcard = by_filter.get(&SubjectFilter::Any);

        let mut delivered = 0;
        for id in exact.into_iter().chain(wildcard).flatten() {
            let Some(entry) = tables.entries.get(id) else {
                continue;
            };
            match entry.queue.try_send(Arc::clone(&event)) {
                Ok(()) => {
                    entry.overflowing.store(false, Ordering::Relaxed);
                    delivered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    if !entry.overflowing.swap(true, Ordering::Relaxed) {
                        warn!(
                            subscription = %id,
                            kind = %entry.kind,
                            capacity = SUBSCRIPTION_QUEUE_CAPACITY,
                            "Subscriber queue full, dropping events"
                        );
                    }
                }
                Err(TrySendError::Closed(_)) => {}
            }
        }

        trace!(
            kind = %event.kind,
            subject = ?event.subject,
            delivered,
            "Routed event"
        );
        delivered
    }

    fn emit(&self, command: ListenCommand) {
        if let Some(listener) = &self.listener {
            if listener.send(command).is_err() {
                debug!("Listen command receiver dropped");
            }
        }
    }
}

async fn run_subscription(
    id: SubscriptionId,
    kind: EventKind,
    handler: Arc<dyn EventHandler>,
    active: Arc<AtomicBool>,
    mut queue: mpsc::Receiver<Arc<EventFrame>>,
    counters: Arc<Counters>,
) {
    while let Some(event) = queue.recv().await {
        if !active.load(Ordering::Acquire) {
            break;
        }

        let handler = Arc::clone(&handler);
        let outcome = tokio::task::spawn_blocking(move || handler.handle(&event)).await;
        counters.dispatched.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %id, kind = %kind, error = %e, "Event handler failed");
            }
            Err(e) if e.is_panic() => {
                counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(subscription = %id, kind = %kind, "Event handler panicked");
            }
            Err(e) => {
                debug!(subscription = %id, error = %e, "Event handler cancelled");
                break;
            }
        }
    }
    trace!(subscription = %id, "Subscription dispatch stopped");
}

/// Routes hub events to subscribers
///
/// Cheap to clone; clones share one subscription table. `subscribe` and
/// `unsubscribe` are synchronous and may be called from any thread.
#[derive(Clone)]
pub struct EventRouter {
    inner: Arc<RouterInner>,
}

impl EventRouter {
    /// Create a router that does not report listen commands
    ///
    /// Must be called from within a tokio runtime; dispatch tasks are
    /// spawned onto it.
    pub fn new() -> Result<Self> {
        Self::build(None)
    }

    /// Create a router that reports listen start/stop on `listener`
    pub fn with_listener(listener: mpsc::UnboundedSender<ListenCommand>) -> Result<Self> {
        Self::build(Some(listener))
    }

    fn build(listener: Option<mpsc::UnboundedSender<ListenCommand>>) -> Result<Self> {
        let runtime = Handle::try_current().map_err(|_| RouterError::NoRuntime)?;
        Ok(Self {
            inner: Arc::new(RouterInner {
                tables: RwLock::new(Tables::default()),
                next_id: AtomicU64::new(1),
                runtime,
                listener,
                counters: Arc::new(Counters::default()),
            }),
        })
    }

    /// Register a handler for events of `kind` matching `subject`
    ///
    /// Subscribing to a subject the hub has never mentioned is fine; the
    /// handler runs on the first matching event.
    pub fn subscribe<H: EventHandler>(
        &self,
        kind: impl Into<EventKind>,
        subject: impl Into<SubjectFilter>,
        handler: H,
    ) -> SubscriptionId {
        self.inner
            .subscribe(kind.into(), subject.into(), Arc::new(handler))
    }

    /// Like [`EventRouter::subscribe`], but removed when the guard drops
    pub fn subscribe_scoped<H: EventHandler>(
        &self,
        kind: impl Into<EventKind>,
        subject: impl Into<SubjectFilter>,
        handler: H,
    ) -> SubscriptionGuard {
        let id = self.subscribe(kind, subject, handler);
        SubscriptionGuard::new(id, Arc::downgrade(&self.inner))
    }

    /// Remove a subscription
    ///
    /// Events already queued for it are discarded. Returns false if the
    /// subscription was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.inner.unsubscribe(id)
    }

    /// Hand an inbound event to every matching subscription
    ///
    /// Returns the number of subscriptions the event was queued for.
    pub fn route(&self, event: EventFrame) -> usize {
        self.inner.route(event)
    }

    pub fn is_subscribed(&self, id: SubscriptionId) -> bool {
        self.inner.tables.read().entries.contains_key(&id)
    }

    /// Kinds that currently have at least one subscription
    pub fn listened_kinds(&self) -> Vec<EventKind> {
        self.inner.tables.read().listen_refs.keys().cloned().collect()
    }

    /// Remove every subscription. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let ids: Vec<SubscriptionId> = self.inner.tables.read().entries.keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.inner.unsubscribe(*id))
            .count()
    }

    pub fn stats(&self) -> RouterStats {
        let tables = self.inner.tables.read();
        let counters = &self.inner.counters;
        RouterStats {
            active_subscriptions: tables.entries.len(),
            listened_kinds: tables.listen_refs.len(),
            routed_events: counters.routed.load(Ordering::Relaxed),
            dispatched: counters.dispatched.load(Ordering::Relaxed),
            handler_failures: counters.failures.load(Ordering::Relaxed),
            dropped_events: counters.dropped.load(Ordering::Relaxed),
        }
    }

    #[cfg(test)]
    pub(crate) fn downgrade(&self) -> std::sync::Weak<RouterInner> {
        Arc::downgrade(&self.inner)
    }
}

impl std::fmt::Debug for EventRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventRouter")
            .field("stats", &self.stats())
            .finish()
    }
}
