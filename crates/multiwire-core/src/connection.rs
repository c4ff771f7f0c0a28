//! Per-transport connection state.
//!
//! Each transport kind owns one immutable [`ConnectionState`] that is replaced
//! wholesale on every lifecycle event. Reads never take a lock; writes to one
//! kind are serialized so events are published in generation order.

use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::{TransportKind, clock::unix_millis};

/// Capacity of the connection event channel.
const EVENT_CAPACITY: usize = 256;

/// Latest observed state of one transport.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionState {
    pub connected: bool,
    /// Peer description reported by the driver, if any.
    pub peer: Option<String>,
    /// When this state was observed (Unix millis). Zero before the first event.
    pub changed_at_ms: i64,
    /// Number of state changes so far.
    pub generation: u64,
}

/// Pushed to subscribers whenever a transport's state changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionEvent {
    pub transport: TransportKind,
    pub connected: bool,
    pub peer: Option<String>,
    /// Generation of the state this event announces.
    pub generation: u64,
}

/// Connection status of every transport kind.
pub struct ConnectionTracker {
    states: [ArcSwap<ConnectionState>; TransportKind::ALL.len()],
    writers: [Mutex<()>; TransportKind::ALL.len()],
    events: broadcast::Sender<ConnectionEvent>,
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTracker {
    /// Create a tracker with every transport disconnected.
    #[must_use]
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            states: std::array::from_fn(|_| ArcSwap::from_pointee(ConnectionState::default())),
            writers: std::array::from_fn(|_| Mutex::new(())),
            events,
        }
    }

    /// Hand out the write side for one transport.
    ///
    /// Only drivers should hold reporters; the dispatcher only reads.
    #[must_use]
    pub fn reporter(self: &Arc<Self>, kind: TransportKind) -> ConnectionReporter {
        ConnectionReporter {
            kind,
            tracker: Arc::clone(self),
        }
    }

    /// Whether `kind` is currently connected.
    #[must_use]
    pub fn is_connected(&self, kind: TransportKind) -> bool {
        self.states[kind.index()].load().connected
    }

    /// Full state of `kind`.
    #[must_use]
    pub fn state(&self, kind: TransportKind) -> Arc<ConnectionState> {
        self.states[kind.index()].load_full()
    }

    /// Connected flag of every kind.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(TransportKind, bool)> {
        TransportKind::ALL
            .iter()
            .map(|&kind| (kind, self.is_connected(kind)))
            .collect()
    }

    /// Receiver for state changes.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Replace the state of `kind`. Returns whether anything changed.
    ///
    /// The event is published while the kind's writer lock is held, so
    /// subscribers see events in the same order as `generation`.
    fn apply(&self, kind: TransportKind, connected: bool, peer: Option<String>) -> bool {
        let _writer = self.writers[kind.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let slot = &self.states[kind.index()];

        let generation = {
            let current = slot.load();
            if current.connected == connected && current.peer == peer {
                return false;
            }
            current.generation + 1
        };
        slot.store(Arc::new(ConnectionState {
            connected,
            peer: peer.clone(),
            changed_at_ms: unix_millis(),
            generation,
        }));

        tracing::info!(
            transport = %kind,
            connected,
            peer = ?peer,
            generation,
            "Transport state changed"
        );
        let _ = self.events.send(ConnectionEvent {
            transport: kind,
            connected,
            peer,
            generation,
        });
        true
    }
}

/// Lifecycle callbacks a driver uses to publish its connection state.
///
/// Reporters may be cloned and called from several tasks; the tracker orders
/// their updates per kind. Callers that need "connected while any peer is
/// attached" semantics must still count peers themselves, as `PeerSet` does.
#[derive(Clone)]
pub struct ConnectionReporter {
    kind: TransportKind,
    tracker: Arc<ConnectionTracker>,
}

impl ConnectionReporter {
    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.kind
    }

    /// The transport has a live peer.
    pub fn on_connect(&self, peer: Option<String>) {
        self.tracker.apply(self.kind, true, peer);
    }

    /// The transport lost its last peer.
    pub fn on_disconnect(&self) {
        self.tracker.apply(self.kind, false, None);
    }
}
