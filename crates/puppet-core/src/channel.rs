use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::debug;

use crate::{
    types::PuppetEvent,
    watchdog::{Watchdog, WatchdogFood},
};

/// Broadcast event stream type used by automation-layer subscribers.
pub type EventStream = broadcast::Receiver<PuppetEvent>;

/// Publish side of the puppet event bus.
///
/// Handed to backends at bring-up. Inbound events feed the session watchdog
/// before they are fanned out.
#[derive(Clone, Debug)]
pub struct EventSink {
    event_tx: broadcast::Sender<PuppetEvent>,
    watchdog: Arc<Watchdog>,
}

impl EventSink {
    pub fn new(event_buffer: usize, watchdog: Arc<Watchdog>) -> Self {
        let (event_tx, _) = broadcast::channel(event_buffer.max(1));
        Self { event_tx, watchdog }
    }

    /// Subscribe to emitted puppet events.
    pub fn subscribe(&self) -> EventStream {
        self.event_tx.subscribe()
    }

    /// Emit an event to all subscribers.
    ///
    /// Emission is best-effort and never blocks; lagged subscribers are
    /// handled by `broadcast`.
    pub fn emit(&self, event: PuppetEvent) {
        if event.is_inbound() {
            self.watchdog.feed(WatchdogFood::Inbound(event.name()));
        }
        debug!(event = event.name(), "emitting puppet event");
        let _ = self.event_tx.send(event);
    }
}
