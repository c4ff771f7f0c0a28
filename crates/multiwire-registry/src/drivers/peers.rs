//! Fan-out set of attached peers shared by the stream-style drivers.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock},
};

use bytes::Bytes;
pub use multiwire_core::PeerId;
use multiwire_core::{ConnectionReporter, DriverError, TransportKind};
use tokio::sync::mpsc;
use uuid::Uuid;

struct Peer {
    label: String,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// Peers attached to one transport.
///
/// Each peer gets an unbounded queue drained by its own writer task, so a
/// send never waits on socket I/O. The transport counts as connected while at
/// least one peer is attached.
pub struct PeerSet {
    reporter: ConnectionReporter,
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerSet {
    #[must_use]
    pub fn new(reporter: ConnectionReporter) -> Self {
        Self {
            reporter,
            peers: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn kind(&self) -> TransportKind {
        self.reporter.kind()
    }

    /// Attach a peer; returns its id and the queue its writer should drain.
    pub fn attach(&self, label: impl Into<String>) -> (PeerId, mpsc::UnboundedReceiver<Bytes>) {
        let id = Uuid::new_v4();
        let label = label.into();
        let (tx, rx) = mpsc::unbounded_channel();

        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if peers.is_empty() {
            // Reported under the lock so connect/disconnect cannot reorder.
            self.reporter.on_connect(Some(label.clone()));
        }
        tracing::debug!(transport = %self.kind(), %id, peer = %label, "Peer attached");
        peers.insert(id, Peer { label, tx });
        (id, rx)
    }

    /// Detach a peer. Unknown ids are ignored.
    pub fn detach(&self, id: PeerId) {
        let mut peers = self.peers.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(peer) = peers.remove(&id) {
            tracing::debug!(transport = %self.kind(), %id, peer = %peer.label, "Peer detached");
            if peers.is_empty() {
                self.reporter.on_disconnect();
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `frame` for every attached peer.
    ///
    /// # Errors
    /// Returns `NoPeers` if nobody is attached, or `Closed` if every peer's
    /// writer has already gone away.
    pub fn broadcast(&self, frame: &Bytes) -> Result<usize, DriverError> {
        let senders: Vec<_> = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|p| p.tx.clone())
            .collect();
        if senders.is_empty() {
            return Err(DriverError::NoPeers);
        }

        let delivered = senders
            .iter()
            .filter(|tx| tx.send(frame.clone()).is_ok())
            .count();
        if delivered == 0 {
            return Err(DriverError::Closed);
        }
        Ok(delivered)
    }

    /// Queue `frame` for one peer.
    ///
    /// # Errors
    /// Returns `Closed` if the peer has detached or its writer is gone.
    pub fn send_to(&self, id: PeerId, frame: &Bytes) -> Result<(), DriverError> {
        let tx = self
            .peers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|p| p.tx.clone())
            .ok_or(DriverError::Closed)?;
        tx.send(frame.clone()).map_err(|_| DriverError::Closed)
    }
}
