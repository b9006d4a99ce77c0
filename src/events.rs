//! Typed lifecycle events.
//!
//! One channel carries all lifecycle events as a tagged enum; every
//! subscriber gets its own unbounded receiver, so a slow observer never
//! stalls the control thread or other observers.

use crossbeam_channel::{unbounded, Receiver, Sender};
use uuid::Uuid;

use crate::transport::TransportState;

/// A lifecycle event emitted by the registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DriverEvent {
    /// The device's aggregate audio connectivity flipped. Fires only on
    /// edge transitions, never before identity resolution completes.
    DeviceConnectionChanged { path: String, connected: bool },
    /// A previously unseen service UUID appeared on a device.
    DeviceUuidAdded { path: String, uuid: Uuid },
    /// A transport changed state. Delivered in cause order; the final
    /// `Disconnected` for a transport fires before it is released.
    TransportStateChanged { path: String, state: TransportState },
    /// HSP microphone gain changed on the remote.
    TransportMicrophoneGainChanged { path: String, gain: u16 },
    /// HSP speaker gain changed on the remote.
    TransportSpeakerGainChanged { path: String, gain: u16 },
    /// HSP noise-reduction hint changed.
    TransportNrecChanged { path: String, nrec: bool },
}

/// Fan-out bus for [`DriverEvent`].
#[derive(Debug, Default)]
pub struct EventBus {
    subscribers: Vec<Sender<DriverEvent>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new observer.
    pub fn subscribe(&mut self) -> Receiver<DriverEvent> {
        let (tx, rx) = unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Deliver an event to every live subscriber; dropped receivers are
    /// pruned.
    pub fn emit(&mut self, event: DriverEvent) {
        self.subscribers
            .retain(|tx| tx.send(event.clone()).is_ok());
    }
}
