//! Connection event fan-out
//!
//! Every subscriber sees state, bandwidth, close and error events in the
//! order the controller published them.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::trace;

use crate::vpn::state::{BandwidthSample, ConnectionState};

/// Events published by the connection controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum VpnEvent {
    /// Latest connection state, `None` once torn down
    State(Option<ConnectionState>),
    /// Latest byte counters, `None` once torn down
    Bandwidth(Option<BandwidthSample>),
    /// The supervised daemon was shut down
    Close,
    /// Asynchronous failure
    Error(String),
}

/// Broadcast bus for [`VpnEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    event_tx: broadcast::Sender<VpnEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    /// Lagging subscribers lose the oldest events beyond `capacity`
    pub fn with_capacity(capacity: usize) -> Self {
        let (event_tx, _) = broadcast::channel(capacity);
        Self { event_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<VpnEvent> {
        self.event_tx.subscribe()
    }

    /// Publish to all current subscribers; having none is not an error
    pub fn publish(&self, event: VpnEvent) {
        trace!("Publishing {:?}", event);
        let _ = self.event_tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.event_tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
