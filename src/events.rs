//! Engine event surface.
//!
//! Each event is one variant of `Event`, with `EventKind` as the stable
//! name used for subscriptions. Events queue inside the engine and are also
//! fanned out to registered callbacks when the engine flushes its output.

use crate::common::Error;
use crate::payload::DevicePresence;
use crate::vc::VerifiedInfo;

use serde_json::Value;

/// Stable event names for subscription filtering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    ConnectionEstablished,
    ConnectionClosed,
    HandshakeComplete,
    PacketReceived,
    LedResponse,
    OwnershipRemovalAck,
    DeviceDiscovered,
    Error,
}

/// An engine event with its payload.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    ConnectionEstablished {
        device_id: String,
        verified: VerifiedInfo,
    },

    ConnectionClosed {
        device_id: String,
        reason: String,
    },

    HandshakeComplete {
        device_id: String,
    },

    PacketReceived {
        device_id: String,
        bytes: usize,
    },

    LedResponse {
        device_id: String,
        payload: Value,
    },

    OwnershipRemovalAck {
        device_id: String,
        payload: Value,
    },

    DeviceDiscovered {
        info: DevicePresence,
    },

    Error {
        device_id: String,
        error: Error,
    },
}

impl Event {
    pub fn kind(&self) -> EventKind {
        match self {
            Event::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Event::ConnectionClosed { .. } => EventKind::ConnectionClosed,
            Event::HandshakeComplete { .. } => EventKind::HandshakeComplete,
            Event::PacketReceived { .. } => EventKind::PacketReceived,
            Event::LedResponse { .. } => EventKind::LedResponse,
            Event::OwnershipRemovalAck { .. } => EventKind::OwnershipRemovalAck,
            Event::DeviceDiscovered { .. } => EventKind::DeviceDiscovered,
            Event::Error { .. } => EventKind::Error,
        }
    }
}

pub type EventCallback = Box<dyn FnMut(&Event)>;

/// Registered event observers. One callback may listen to one kind; a
/// subscriber wanting everything registers per kind.
#[derive(Default)]
pub struct Subscribers {
    subs: Vec<(EventKind, EventCallback)>,
}

impl Subscribers {
    pub fn new() -> Self {
        Subscribers { subs: Vec::new() }
    }

    pub fn add(&mut self, kind: EventKind, callback: EventCallback) {
        self.subs.push((kind, callback));
    }

    pub fn dispatch(&mut self, event: &Event) {
        let kind = event.kind();
        for (k, callback) in self.subs.iter_mut() {
            if *k == kind {
                callback(event);
            }
        }
    }
}
