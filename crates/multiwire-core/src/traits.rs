//! Driver seam between the dispatcher and concrete transports.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::TransportKind;

/// Driver-level send failure.
#[derive(Debug, Error)]
pub enum DriverError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Transport closed")]
    Closed,
    #[error("No peers attached")]
    NoPeers,
}

/// Identifies one attached peer within a transport.
pub type PeerId = Uuid;

/// Raw frame received by a driver, before envelope parsing.
#[derive(Debug, Clone)]
pub struct InboundFrame {
    pub transport: TransportKind,
    /// Peer the frame came from, when the driver tracks peers.
    pub peer: Option<PeerId>,
    pub bytes: Bytes,
}

/// Channel drivers push received frames into.
pub type InboundSender = mpsc::UnboundedSender<InboundFrame>;

/// Channel the dispatcher drains.
pub type InboundReceiver = mpsc::UnboundedReceiver<InboundFrame>;

/// Create the inbound frame channel.
#[must_use]
pub fn inbound_channel() -> (InboundSender, InboundReceiver) {
    mpsc::unbounded_channel()
}

/// One wire transport.
///
/// Drivers report their lifecycle through a
/// [`ConnectionReporter`](crate::ConnectionReporter) and deliver received
/// frames through an [`InboundSender`].
#[async_trait]
pub trait TransportDriver: Send + Sync {
    /// Which transport this driver serves.
    fn kind(&self) -> TransportKind;

    /// Write one encoded envelope to the wire.
    ///
    /// Framing is the driver's concern. Whether concurrent calls are written
    /// in call order is up to the driver.
    async fn send(&self, frame: Bytes) -> Result<(), DriverError>;

    /// Write one encoded envelope to a single peer.
    ///
    /// Drivers without per-peer addressing fall back to [`Self::send`].
    async fn send_to_peer(&self, peer: PeerId, frame: Bytes) -> Result<(), DriverError> {
        let _ = peer;
        self.send(frame).await
    }
}
