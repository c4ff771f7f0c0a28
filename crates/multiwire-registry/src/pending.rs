//! Outstanding requests awaiting a correlated reply.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard, PoisonError},
};

use multiwire_core::Envelope;
use tokio::sync::oneshot;

/// Requests keyed by the `request_id` their reply must carry.
#[derive(Default)]
pub struct PendingRequests {
    waiters: Mutex<HashMap<String, oneshot::Sender<Envelope>>>,
}

impl PendingRequests {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Envelope>>> {
        self.waiters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start waiting for a reply to `key`.
    ///
    /// The entry is removed when the returned guard is dropped, whether or
    /// not a reply arrived.
    pub fn register(&self, key: &str) -> PendingGuard<'_> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key.to_string(), tx);
        PendingGuard {
            pending: self,
            key: key.to_string(),
            rx: Some(rx),
        }
    }

    /// Hand `reply` to whoever waits on its `request_id`.
    ///
    /// Returns `false` if nobody was waiting.
    pub fn complete(&self, reply: Envelope) -> bool {
        if reply.request_id().is_empty() {
            return false;
        }
        let waiter = self.lock().remove(reply.request_id());
        waiter.is_some_and(|tx| tx.send(reply).is_ok())
    }

    /// Whether a waiter exists for `key`.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.lock().contains_key(key)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Registration for one outstanding request.
pub struct PendingGuard<'a> {
    pending: &'a PendingRequests,
    key: String,
    rx: Option<oneshot::Receiver<Envelope>>,
}

impl PendingGuard<'_> {
    /// Wait for the reply. Returns `None` if the waiter was dropped.
    pub async fn reply(&mut self) -> Option<Envelope> {
        match self.rx.as_mut() {
            Some(rx) => rx.await.ok(),
            None => None,
        }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.key);
    }
}
