//! Core building blocks for multi-transport messaging.
//!
//! This crate provides:
//! - `Envelope` - Binary message envelope with correlation ids
//! - `ConnectionTracker` - Lock-free per-transport connection state
//! - `SnapshotStore` - Bounded history + live notifications
//! - `TransportDriver` trait for wire transports

pub mod clock;
pub mod connection;
pub mod envelope;
pub mod kind;
pub mod snapshot_store;
pub mod traits;

pub use connection::{ConnectionEvent, ConnectionReporter, ConnectionState, ConnectionTracker};
pub use envelope::{Envelope, EnvelopeError, EnvelopeType, MalformedEnvelope};
pub use kind::{Direction, TransportKind, UnknownTransportKind};
pub use snapshot_store::{Snapshot, SnapshotEvent, SnapshotStore};
pub use traits::{
    DriverError, InboundFrame, InboundReceiver, InboundSender, PeerId, TransportDriver,
    inbound_channel,
};
