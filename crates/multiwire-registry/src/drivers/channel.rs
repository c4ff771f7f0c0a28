//! In-process transport driver.
//!
//! Useful for tests, loopback wiring and transports whose real driver lives
//! outside this process. Frames are never serialized to a socket.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use multiwire_core::{
    ConnectionReporter, DriverError, InboundFrame, InboundSender, PeerId, TransportDriver,
    TransportKind,
};
use tokio::sync::mpsc;

use super::peers::PeerSet;

/// Driver whose peers are in-memory channel endpoints.
pub struct ChannelDriver {
    peers: Arc<PeerSet>,
    inbound: InboundSender,
}

impl ChannelDriver {
    /// Create a driver with no peers attached.
    #[must_use]
    pub fn new(reporter: ConnectionReporter, inbound: InboundSender) -> Self {
        Self {
            peers: Arc::new(PeerSet::new(reporter)),
            inbound,
        }
    }

    /// Attach a new in-memory peer. The transport stays connected until every
    /// returned peer is dropped.
    #[must_use]
    pub fn connect(&self, label: impl Into<String>) -> ChannelPeer {
        let (id, rx) = self.peers.attach(label);
        ChannelPeer {
            id,
            peers: Arc::clone(&self.peers),
            rx,
            inbound: self.inbound.clone(),
        }
    }
}

#[async_trait]
impl TransportDriver for ChannelDriver {
    fn kind(&self) -> TransportKind {
        self.peers.kind()
    }

    async fn send(&self, frame: Bytes) -> Result<(), DriverError> {
        self.peers.broadcast(&frame).map(|_| ())
    }

    async fn send_to_peer(&self, peer: PeerId, frame: Bytes) -> Result<(), DriverError> {
        self.peers.send_to(peer, &frame)
    }
}

/// Remote end of a [`ChannelDriver`].
pub struct ChannelPeer {
    id: PeerId,
    peers: Arc<PeerSet>,
    rx: mpsc::UnboundedReceiver<Bytes>,
    inbound: InboundSender,
}

impl ChannelPeer {
    #[must_use]
    pub const fn id(&self) -> PeerId {
        self.id
    }

    /// Next frame the server sent to this peer.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }

    /// Next frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<Bytes> {
        self.rx.try_recv().ok()
    }

    /// Deliver a frame to the server as if it arrived on the wire.
    ///
    /// Returns `false` if the server side is gone.
    pub fn send(&self, bytes: Bytes) -> bool {
        self.inbound
            .send(InboundFrame {
                transport: self.peers.kind(),
                peer: Some(self.id),
                bytes,
            })
            .is_ok()
    }
}

impl Drop for ChannelPeer {
    fn drop(&mut self) {
        self.peers.detach(self.id);
    }
}
