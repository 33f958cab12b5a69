//! Frame demultiplexer
//!
//! The session hands every decoded frame to one sink. Replies and pongs
//! belong to the multiplexer, events to the router; lifecycle transitions
//! fail pending calls or trigger the hub
//! subscription replay.

use std::sync::Arc;

use hass_events::EventRouter;
use hass_protocol::{InboundFrame, ProtocolError};
use hass_session::{FrameSink, LifecycleEvent};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::error::BridgeError;
use crate::listener::HubSubscriptions;
use crate::multiplexer::RequestMultiplexer;

pub(crate) struct BridgeSink {
    pub multiplexer: Arc<RequestMultiplexer>,
    pub router: EventRouter,
    pub hub_subscriptions: HubSubscriptions,
    pub ready_tx: mpsc::UnboundedSender<()>,
}

impl FrameSink for BridgeSink {
    fn on_frame(&self, frame: InboundFrame) {
        match frame {
            InboundFrame::Reply(reply) => {
                self.multiplexer.complete(reply);
            }
            InboundFrame::Pong { id } => {
                self.multiplexer.complete_pong(id);
            }
            InboundFrame::Event { subscription, event } => {
                if let Some(id) = subscription {
                    if !self.hub_subscriptions.accepts(&event.kind, id) {
                        debug!(
                            subscription = id,
                            kind = %event.kind,
                            "Dropping event from an untracked hub subscription"
                        );
                        return;
                    }
                }
                let delivered = self.router.route(event);
                if delivered == 0 {
                    debug!(subscription = ?subscription, "Event had no local subscribers");
                }
            }
            other => {
                debug!(frame = ?other, "Ignoring handshake frame outside the handshake");
            }
        }
    }

    fn on_lifecycle(&self, event: &LifecycleEvent) {
        if event.is_auth_rejection() {
            let reason = event
                .reason
                .clone()
                .unwrap_or_else(|| "access token rejected".to_string());
            error!(reason = %reason, "Bridge degraded until restart");
            self.multiplexer
                .fail_all(BridgeError::BridgeUnavailable(reason));
            return;
        }

        if event.is_loss_of_ready() {
            let failed = self.multiplexer.fail_all(BridgeError::ConnectionLost);
            if failed > 0 {
                info!(failed, to = %event.to, "Session left Ready with calls in flight");
            }
        }

        if event.is_ready() && self.ready_tx.send(()).is_err() {
            debug!("Listen worker gone, not replaying hub subscriptions");
        }
    }

    fn on_protocol_violation(&self, error: &ProtocolError) {
        debug!(error = %error, "Session dropped a malformed frame");
    }
}
