//! Process-wide event bus.
//!
//! A thin wrapper over a tokio broadcast channel carrying [`BusEvent`]s
//! between the config service, the engine and the management layer. Every
//! subscriber sees every event; addressing is by the `destination` field,
//! either a specific appliance identity or [`DEST_ALL`].

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

/// Destination value addressing every appliance in the cluster.
pub const DEST_ALL: &str = "ALL";

/// Event types the engine participates in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// Request to compute archival metadata for a PV.
    ComputeMetaInfo,
    /// Confirmation that a metadata computation was launched.
    MetaInfoRequested,
    /// Metadata computation finished; payload carries the JSON metadata.
    MetaInfoFinished,
    /// Request to begin archiving a PV whose type info has settled.
    StartArchivingPV,
    /// Confirmation that archiving began.
    StartedArchivingPV,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BusEvent {
    pub event_type: EventType,
    /// Appliance identity this event is addressed to, or [`DEST_ALL`].
    pub destination: String,
    /// Identity of the appliance that posted the event.
    pub source: String,
    pub pv_name: String,
    pub payload: Option<String>,
}

impl BusEvent {
    pub fn new(
        event_type: EventType,
        destination: impl Into<String>,
        source: impl Into<String>,
        pv_name: impl Into<String>,
    ) -> Self {
        Self {
            event_type,
            destination: destination.into(),
            source: source.into(),
            pv_name: pv_name.into(),
            payload: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    /// Whether an appliance with `identity` should process this event.
    pub fn is_for(&self, identity: &str) -> bool {
        self.destination == DEST_ALL || self.destination == identity
    }
}

/// Cloneable handle onto the broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Posts an event. An event with no live subscribers is dropped, which
    /// is normal during startup and teardown.
    pub fn post(&self, event: BusEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event posted with no live subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }
}
