//! Bounded history of processed envelopes with live change notifications.

use std::{
    collections::VecDeque,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use futures::StreamExt;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use crate::{Direction, Envelope, TransportKind, clock::unix_millis};

/// Default number of retained snapshots.
pub const DEFAULT_CAPACITY: usize = 500;

/// Capacity of the live event channel.
const EVENT_CAPACITY: usize = 1024;

/// Record of one envelope that crossed a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    /// Position in the store's insertion order; never reused.
    pub seq: u64,
    pub transport: TransportKind,
    pub direction: Direction,
    pub envelope: Envelope,
    /// Unix millis at record time.
    pub timestamp_ms: i64,
}

/// Change pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotEvent {
    Recorded(Snapshot),
    Cleared,
}

struct Inner {
    entries: VecDeque<Snapshot>,
    next_seq: u64,
}

/// Snapshot store with bounded FIFO eviction.
///
/// Every mutation happens under one write lock and publishes its event
/// while still holding it, so subscribers see events in the same order the
/// history was changed.
pub struct SnapshotStore {
    inner: RwLock<Inner>,
    capacity: usize,
    sender: broadcast::Sender<SnapshotEvent>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl SnapshotStore {
    /// Create a store keeping at most `capacity` entries (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: RwLock::new(Inner {
                entries: VecDeque::with_capacity(capacity.min(1024)),
                next_seq: 1,
            }),
            capacity,
            sender,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append a snapshot, evicting the oldest entries beyond capacity.
    pub fn record(
        &self,
        transport: TransportKind,
        direction: Direction,
        envelope: Envelope,
    ) -> Snapshot {
        let mut inner = self.write();
        let snapshot = Snapshot {
            seq: inner.next_seq,
            transport,
            direction,
            envelope,
            timestamp_ms: unix_millis(),
        };
        inner.next_seq += 1;

        while inner.entries.len() >= self.capacity {
            inner.entries.pop_front();
        }
        inner.entries.push_back(snapshot.clone());
        let _ = self.sender.send(SnapshotEvent::Recorded(snapshot.clone()));
        drop(inner);

        tracing::trace!(seq = snapshot.seq, %transport, ?direction, "Recorded snapshot");
        snapshot
    }

    /// Copy of every retained snapshot, oldest first.
    #[must_use]
    pub fn get_all(&self) -> Vec<Snapshot> {
        self.read().entries.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Remove every snapshot and notify subscribers.
    pub fn clear(&self) {
        let mut inner = self.write();
        let removed = inner.entries.len();
        inner.entries.clear();
        let _ = self.sender.send(SnapshotEvent::Cleared);
        drop(inner);

        tracing::debug!(removed, "Cleared snapshot store");
    }

    /// Get a receiver for live updates.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SnapshotEvent> {
        self.sender.subscribe()
    }

    /// Current history plus a receiver that starts exactly after it.
    #[must_use]
    pub fn subscribe_with_history(&self) -> (Vec<Snapshot>, broadcast::Receiver<SnapshotEvent>) {
        // Holding the read lock blocks writers, so no event can fall between
        // the copy and the subscription.
        let inner = self.read();
        let rx = self.sender.subscribe();
        let history = inner.entries.iter().cloned().collect();
        drop(inner);
        (history, rx)
    }

    /// Stream that yields the history as `Recorded` events, then live updates.
    ///
    /// Lagged receivers skip the events they missed.
    #[must_use]
    pub fn history_plus_stream(&self) -> futures::stream::BoxStream<'static, SnapshotEvent> {
        let (history, rx) = self.subscribe_with_history();

        let hist = futures::stream::iter(history.into_iter().map(SnapshotEvent::Recorded));
        let live = BroadcastStream::new(rx).filter_map(|res| async move { res.ok() });

        Box::pin(hist.chain(live))
    }
}
