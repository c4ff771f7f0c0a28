//! Transport registry and dispatcher.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;
use futures::future;
use multiwire_core::{
    ConnectionTracker, Direction, DriverError, Envelope, EnvelopeError, EnvelopeType, InboundFrame,
    InboundReceiver, MalformedEnvelope, PeerId, SnapshotStore, TransportDriver, TransportKind,
    envelope::generate_id,
};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::pending::PendingRequests;

/// Dispatch error.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Transport not registered: {0}")]
    TransportNotRegistered(TransportKind),
    #[error("Transport not connected: {0}")]
    TransportNotConnected(TransportKind),
    #[error("Send over {kind} failed: {source}")]
    TransportSendFailed {
        kind: TransportKind,
        source: DriverError,
    },
    #[error("Malformed envelope: {0}")]
    MalformedEnvelope(#[from] MalformedEnvelope),
    #[error("No response within {0:?}")]
    ResponseTimeout(Duration),
}

impl From<EnvelopeError> for DispatchError {
    fn from(err: EnvelopeError) -> Self {
        match err {
            EnvelopeError::InvalidArgument(msg) => Self::InvalidArgument(msg),
            EnvelopeError::Malformed(reason) => Self::MalformedEnvelope(reason),
        }
    }
}

/// Result of one transport within a broadcast.
#[derive(Debug)]
pub struct TransportOutcome {
    pub transport: TransportKind,
    pub result: Result<(), DispatchError>,
}

/// Per-transport results of [`Dispatcher::send_all`].
#[derive(Debug)]
pub struct BroadcastReport {
    /// Envelope sent on every transport.
    pub envelope: Envelope,
    /// One entry per attempted transport, in transport order.
    pub outcomes: Vec<TransportOutcome>,
}

impl BroadcastReport {
    /// Transports the envelope reached.
    pub fn succeeded(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_ok())
            .map(|o| o.transport)
    }

    /// Transports that failed, with the reason.
    pub fn failed(&self) -> impl Iterator<Item = (TransportKind, &DispatchError)> + '_ {
        self.outcomes
            .iter()
            .filter_map(|o| o.result.as_ref().err().map(|e| (o.transport, e)))
    }

    #[must_use]
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }
}

/// Classification of a parsed inbound envelope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// A reply that completed a pending [`Dispatcher::request`].
    Correlated(Envelope),
    /// Anything nobody was waiting for.
    Unsolicited(Envelope),
}

/// Transport registry and dispatcher.
///
/// Drivers are registered through `&mut self` before the dispatcher is
/// shared, so the registry is read-only once it sits behind an `Arc`.
/// Connection state is read from the [`ConnectionTracker`], which only drivers
/// write to.
///
/// The dispatcher adds no ordering of its own: two concurrent sends to the
/// same transport reach the wire in whatever order the driver writes them.
/// Callers that need ordered delivery must await one send before issuing the
/// next.
pub struct Dispatcher {
    drivers: BTreeMap<TransportKind, Arc<dyn TransportDriver>>,
    connections: Arc<ConnectionTracker>,
    snapshots: Arc<SnapshotStore>,
    pending: PendingRequests,
}

impl Dispatcher {
    /// Create a dispatcher with no transports.
    #[must_use]
    pub fn new(connections: Arc<ConnectionTracker>, snapshots: Arc<SnapshotStore>) -> Self {
        Self {
            drivers: BTreeMap::new(),
            connections,
            snapshots,
            pending: PendingRequests::new(),
        }
    }

    /// Register the driver for its transport kind.
    ///
    /// # Errors
    /// Returns `InvalidArgument` if a driver for that kind already exists.
    pub fn register(&mut self, driver: Arc<dyn TransportDriver>) -> Result<(), DispatchError> {
        let kind = driver.kind();
        if self.drivers.contains_key(&kind) {
            return Err(DispatchError::InvalidArgument(format!(
                "transport {kind} is already registered"
            )));
        }
        tracing::info!(transport = %kind, "Registered transport");
        self.drivers.insert(kind, driver);
        Ok(())
    }

    /// Registered transport kinds, in order.
    pub fn transports(&self) -> impl Iterator<Item = TransportKind> + '_ {
        self.drivers.keys().copied()
    }

    #[must_use]
    pub const fn connections(&self) -> &Arc<ConnectionTracker> {
        &self.connections
    }

    #[must_use]
    pub const fn snapshots(&self) -> &Arc<SnapshotStore> {
        &self.snapshots
    }

    #[must_use]
    pub const fn pending(&self) -> &PendingRequests {
        &self.pending
    }

    /// Whether `kind` is connected right now.
    #[must_use]
    pub fn is_connected(&self, kind: TransportKind) -> bool {
        self.connections.is_connected(kind)
    }

    /// Connected flag of every registered transport.
    #[must_use]
    pub fn get_status(&self) -> BTreeMap<TransportKind, bool> {
        self.drivers
            .keys()
            .map(|&kind| (kind, self.connections.is_connected(kind)))
            .collect()
    }

    /// Send `message` as a `Request` envelope over one transport.
    ///
    /// Fails fast without touching the driver if the transport is down. No
    /// retry is attempted.
    ///
    /// # Errors
    /// `InvalidArgument` for an empty message, `TransportNotRegistered`,
    /// `TransportNotConnected`, or `TransportSendFailed` if the driver fails.
    pub async fn send_to(
        &self,
        kind: TransportKind,
        message: Bytes,
    ) -> Result<Envelope, DispatchError> {
        ensure_message(&message)?;
        let envelope = Envelope::create_request("", Some(message), None)?;
        self.send_envelope(kind, envelope).await
    }

    /// Send a prebuilt envelope over one transport.
    ///
    /// An outbound snapshot is recorded only after the driver accepted the
    /// frame.
    ///
    /// # Errors
    /// See [`Dispatcher::send_to`].
    pub async fn send_envelope(
        &self,
        kind: TransportKind,
        envelope: Envelope,
    ) -> Result<Envelope, DispatchError> {
        self.send_via(kind, None, envelope).await
    }

    /// Send a prebuilt envelope to one peer of a transport.
    ///
    /// # Errors
    /// See [`Dispatcher::send_to`]. A peer that has gone away surfaces as
    /// `TransportSendFailed`.
    pub async fn send_envelope_to_peer(
        &self,
        kind: TransportKind,
        peer: PeerId,
        envelope: Envelope,
    ) -> Result<Envelope, DispatchError> {
        self.send_via(kind, Some(peer), envelope).await
    }

    async fn send_via(
        &self,
        kind: TransportKind,
        peer: Option<PeerId>,
        envelope: Envelope,
    ) -> Result<Envelope, DispatchError> {
        let driver = self
            .drivers
            .get(&kind)
            .ok_or(DispatchError::TransportNotRegistered(kind))?;
        self.deliver(kind, driver.as_ref(), peer, &envelope).await?;
        Ok(envelope)
    }

    /// Send `message` as one `Broadcast` envelope to every registered
    /// transport, or only to those in `filter` when it is non-empty.
    ///
    /// Best effort: a failure on one transport never stops the others. A
    /// filtered kind without a driver is reported as `TransportNotRegistered`.
    ///
    /// # Errors
    /// Returns `InvalidArgument` for an empty message. Per-transport failures
    /// are reported in the [`BroadcastReport`].
    pub async fn send_all(
        &self,
        message: Bytes,
        filter: Option<&[TransportKind]>,
    ) -> Result<BroadcastReport, DispatchError> {
        ensure_message(&message)?;
        let envelope = Envelope::create("", Some(message), EnvelopeType::Broadcast, None)?;

        let targets: BTreeSet<TransportKind> = match filter {
            Some(filter) if !filter.is_empty() => filter.iter().copied().collect(),
            _ => self.drivers.keys().copied().collect(),
        };
        let outcomes = future::join_all(targets.into_iter().map(|kind| {
            let envelope = &envelope;
            async move {
                let result = match self.drivers.get(&kind) {
                    Some(driver) => self.deliver(kind, driver.as_ref(), None, envelope).await,
                    None => Err(DispatchError::TransportNotRegistered(kind)),
                };
                TransportOutcome {
                    transport: kind,
                    result,
                }
            }
        }))
        .await;

        tracing::debug!(
            id = envelope.id(),
            attempted = outcomes.len(),
            failed = outcomes.iter().filter(|o| o.result.is_err()).count(),
            "Broadcast finished"
        );
        Ok(BroadcastReport { envelope, outcomes })
    }

    /// Send a `Request` and wait for the correlated `Response` or `Error`.
    ///
    /// # Errors
    /// Any [`Dispatcher::send_envelope`] error, or `ResponseTimeout` if no
    /// reply arrives within `timeout`.
    pub async fn request(
        &self,
        kind: TransportKind,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Envelope, DispatchError> {
        let request_id = generate_id();
        let envelope = Envelope::create_request("", Some(payload), Some(&request_id))?;

        let mut waiter = self.pending.register(&request_id);
        self.send_envelope(kind, envelope).await?;

        match tokio::time::timeout(timeout, waiter.reply()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => {
                tracing::warn!(transport = %kind, %request_id, "Request timed out");
                Err(DispatchError::ResponseTimeout(timeout))
            }
        }
    }

    /// Answer `request` over `kind` with a `Response` carrying its
    /// correlation key.
    ///
    /// # Errors
    /// See [`Dispatcher::send_envelope`].
    pub async fn respond(
        &self,
        kind: TransportKind,
        request: &Envelope,
        payload: Bytes,
    ) -> Result<Envelope, DispatchError> {
        let response =
            Envelope::create_response("", Some(payload), Some(request.correlation_key()))?;
        self.send_envelope(kind, response).await
    }

    /// Parse and record one inbound frame with no known sender.
    ///
    /// # Errors
    /// See [`Dispatcher::handle_frame`].
    pub async fn handle_inbound(
        &self,
        kind: TransportKind,
        bytes: Bytes,
    ) -> Result<Inbound, DispatchError> {
        self.handle_frame(InboundFrame {
            transport: kind,
            peer: None,
            bytes,
        })
        .await
    }

    /// Parse and record one inbound frame.
    ///
    /// Replies complete their pending request. A frame that does not parse
    /// is answered with an `Error` envelope to the peer that sent it, or to
    /// the whole transport when the sender is unknown.
    ///
    /// # Errors
    /// Returns `MalformedEnvelope` if the bytes are not a valid envelope.
    pub async fn handle_frame(&self, frame: InboundFrame) -> Result<Inbound, DispatchError> {
        let InboundFrame {
            transport: kind,
            peer,
            bytes,
        } = frame;
        let envelope = match Envelope::parse(&bytes) {
            Ok(envelope) => envelope,
            Err(reason) => {
                tracing::warn!(
                    transport = %kind,
                    len = bytes.len(),
                    "Malformed inbound frame: {reason}"
                );
                let reply =
                    Envelope::create_error(None, Some(&format!("malformed envelope: {reason}")));
                if let Err(e) = self.send_via(kind, peer, reply).await {
                    tracing::warn!(transport = %kind, "Failed to report malformed frame: {e}");
                }
                return Err(reason.into());
            }
        };

        self.snapshots
            .record(kind, Direction::Inbound, envelope.clone());

        if envelope.kind().is_reply() && self.pending.complete(envelope.clone()) {
            tracing::debug!(
                transport = %kind,
                request_id = envelope.request_id(),
                "Correlated reply"
            );
            return Ok(Inbound::Correlated(envelope));
        }
        Ok(Inbound::Unsolicited(envelope))
    }

    /// Drain inbound frames from drivers until every sender is gone.
    ///
    /// Unsolicited envelopes go to `unsolicited` when provided.
    pub fn spawn_inbound_pump(
        self: Arc<Self>,
        mut rx: InboundReceiver,
        unsolicited: Option<mpsc::UnboundedSender<(TransportKind, Envelope)>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let kind = frame.transport;
                match self.handle_frame(frame).await {
                    Ok(Inbound::Correlated(_)) | Err(_) => {}
                    Ok(Inbound::Unsolicited(envelope)) => match &unsolicited {
                        Some(tx) => {
                            let _ = tx.send((kind, envelope));
                        }
                        None => {
                            tracing::debug!(
                                transport = %kind,
                                id = envelope.id(),
                                envelope_type = ?envelope.kind(),
                                "Unsolicited envelope"
                            );
                        }
                    },
                }
            }
            tracing::info!("Inbound pump stopped");
        })
    }

    async fn deliver(
        &self,
        kind: TransportKind,
        driver: &dyn TransportDriver,
        peer: Option<PeerId>,
        envelope: &Envelope,
    ) -> Result<(), DispatchError> {
        if !self.connections.is_connected(kind) {
            tracing::debug!(transport = %kind, id = envelope.id(), "Transport not connected");
            return Err(DispatchError::TransportNotConnected(kind));
        }

        let frame = envelope.encode();
        let sent = match peer {
            Some(peer) => driver.send_to_peer(peer, frame).await,
            None => driver.send(frame).await,
        };
        if let Err(source) = sent {
            tracing::warn!(transport = %kind, id = envelope.id(), "Send failed: {source}");
            return Err(DispatchError::TransportSendFailed { kind, source });
        }

        self.snapshots
            .record(kind, Direction::Outbound, envelope.clone());
        tracing::debug!(
            transport = %kind,
            id = envelope.id(),
            envelope_type = ?envelope.kind(),
            "Sent envelope"
        );
        Ok(())
    }
}

fn ensure_message(message: &Bytes) -> Result<(), DispatchError> {
    if message.is_empty() {
        return Err(DispatchError::InvalidArgument(
            "message must not be empty".to_string(),
        ));
    }
    Ok(())
}
