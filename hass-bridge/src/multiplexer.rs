//! Request multiplexer
//!
//! Many callers share the one session. Each call gets a fresh correlation
//! id and an entry in the pending table; the reply with that id completes
//! it. Completion is exactly-once: whichever of reply, deadline, session
//! loss or caller cancellation removes the entry first decides the
//! outcome, and the others find nothing to do.
//!
//! The table lock is only held to insert, remove or drain entries, never
//! while waiting.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hass_protocol::{HubRequest, OutgoingFrame, ReplyFrame, Value};
use hass_session::Session;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{BridgeError, Result};

type Completion = oneshot::Sender<Result<Value>>;

/// One in-flight request
struct PendingRequest {
    /// Request type, for diagnostics
    kind: String,
    created_at: Instant,
    completion: Completion,
}

/// Point-in-time multiplexer counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultiplexerStats {
    pub in_flight: usize,
    pub completed: u64,
    pub timed_out: u64,
    pub failed_by_disconnect: u64,
    pub cancelled: u64,
    /// Replies with no matching pending request
    pub unmatched_replies: u64,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    timed_out: AtomicU64,
    failed_by_disconnect: AtomicU64,
    cancelled: AtomicU64,
    unmatched: AtomicU64,
}

/// Correlates requests with replies over a shared session
pub struct RequestMultiplexer {
    session: Arc<Session>,
    pending: Mutex<HashMap<u64, PendingRequest>>,
    counters: Counters,
}

impl RequestMultiplexer {
    pub fn new(session: Arc<Session>) -> Self {
        Self {
            session,
            pending: Mutex::new(HashMap::new()),
            counters: Counters::default(),
        }
    }

    /// Send a request and wait for its reply
    ///
    /// Resolves with the reply payload, the hub's error as
    /// [`BridgeError::UpstreamRejected`], [`BridgeError::Timeout`] once
    /// `timeout` passes, or [`BridgeError::ConnectionLost`] if the session
    /// drops first. Fails immediately with [`BridgeError::NotConnected`]
    /// when the session is not Ready.
    ///
    /// Dropping the returned future removes the pending entry; a reply
    /// that arrives afterwards is discarded.
    pub async fn call(&self, request: HubRequest, timeout: Duration) -> Result<Value> {
        let id = self.session.next_id();
        self.call_with_id(id, request, timeout).await
    }

    /// Like [`RequestMultiplexer::call`], with an id taken from
    /// [`RequestMultiplexer::next_id`]
    ///
    /// Used when the id itself matters afterwards, e.g. a
    /// `subscribe_events` id tags the events it produces.
    pub async fn call_with_id(
        &self,
        id: u64,
        request: HubRequest,
        timeout: Duration,
    ) -> Result<Value> {
        let kind = request.kind().to_string();
        let (tx, mut rx) = oneshot::channel();
        let now = Instant::now();

        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&id) {
                return Err(BridgeError::ProtocolViolation(format!(
                    "Correlation id {} is already in flight",
                    id
                )));
            }
            pending.insert(
                id,
                PendingRequest {
                    kind: kind.clone(),
                    created_at: now,
                    completion: tx,
                },
            );
        }
        let cancel_guard = CancelGuard { owner: self, id };

        if let Err(e) = self.session.send(&OutgoingFrame::new(id, request)) {
            self.pending.lock().remove(&id);
            debug!(id, kind = %kind, error = %e, "Request not sent");
            return Err(e.into());
        }
        debug!(id, kind = %kind, timeout_ms = timeout.as_millis() as u64, "Request sent");

        let outcome = match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(BridgeError::ConnectionLost),
            Err(_) => {
                let expired = self.pending.lock().remove(&id);
                match expired {
                    Some(entry) => {
                        self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            id,
                            kind = %entry.kind,
                            waited_ms = entry.created_at.elapsed().as_millis() as u64,
                            "Request timed out"
                        );
                        Err(BridgeError::Timeout(timeout))
                    }
                    // Completed between the deadline firing and the removal
                    None => rx.try_recv().unwrap_or(Err(BridgeError::ConnectionLost)),
                }
            }
        };

        cancel_guard.disarm();
        outcome
    }

    /// Allocate a correlation id without sending anything
    pub fn next_id(&self) -> u64 {
        self.session.next_id()
    }

    /// Complete the pending request a reply belongs to
    ///
    /// Returns false, with a diagnostic, for an unknown or already
    /// completed id.
    pub fn complete(&self, reply: ReplyFrame) -> bool {
        let id = reply.id;
        let Some(entry) = self.pending.lock().remove(&id) else {
            self.counters.unmatched.fetch_add(1, Ordering::Relaxed);
            warn!(id, success = reply.success, "Dropping reply for unknown or completed request");
            return false;
        };

        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!(
            id,
            kind = %entry.kind,
            success = reply.success,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Reply received"
        );

        let result = reply.into_result().map_err(BridgeError::from);
        if entry.completion.send(result).is_err() {
            debug!(id, "Caller stopped waiting before the reply arrived");
        }
        true
    }

    /// Complete a `ping` request; the pong carries no payload
    pub fn complete_pong(&self, id: u64) -> bool {
        self.complete(ReplyFrame::ok(id, Value::Null))
    }

    /// Fail every pending request at once
    ///
    /// The table is drained under the lock and the waiters are woken after
    /// it is released. Returns how many requests were failed.
    pub fn fail_all(&self, error: BridgeError) -> usize {
        let drained: Vec<(u64, PendingRequest)> = self.pending.lock().drain().collect();
        let count = drained.len();

        for (id, entry) in drained {
            debug!(id, kind = %entry.kind, error = %error, "Failing pending request");
            let _ = entry.completion.send(Err(error.clone()));
        }

        if count > 0 {
            self.counters
                .failed_by_disconnect
                .fetch_add(count as u64, Ordering::Relaxed);
            warn!(count, error = %error, "Failed all pending requests");
        }
        count
    }

    /// Number of requests awaiting a reply
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            in_flight: self.pending_count(),
            completed: self.counters.completed.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            failed_by_disconnect: self.counters.failed_by_disconnect.load(Ordering::Relaxed),
            cancelled: self.counters.cancelled.load(Ordering::Relaxed),
            unmatched_replies: self.counters.unmatched.load(Ordering::Relaxed),
        }
    }
}

/// Removes a pending entry if its caller goes away mid-call
struct CancelGuard<'a> {
    owner: &'a RequestMultiplexer,
    id: u64,
}

impl CancelGuard<'_> {
    fn disarm(self) {
        std::mem::forget(self);
    }
}

impl Drop for CancelGuard<'_> {
    fn drop(&mut self) {
        if let Some(entry) = self.owner.pending.lock().remove(&self.id) {
            self.owner.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(id = self.id, kind = %entry.kind, "Request cancelled by caller");
        }
    }
}
