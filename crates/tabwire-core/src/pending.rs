//! Correlation of asynchronous replies with waiting callers.
//!
//! A caller registers before sending its request and gets a [`PendingCall`]
//! holding a fresh ID and the receiving end of a one-shot slot. Whoever sees
//! the reply calls [`PendingCalls::resolve`]. Dropping the [`PendingCall`]
//! removes its entry, so the table shrinks back on every exit path.

use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::oneshot;

type Slots<V> = Arc<DashMap<String, oneshot::Sender<V>>>;

/// Table of in-flight calls keyed by correlation ID.
#[derive(Debug)]
pub struct PendingCalls<V> {
    next_id: AtomicU64,
    slots: Slots<V>,
}

impl<V> PendingCalls<V> {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            slots: Arc::new(DashMap::new()),
        }
    }

    /// Allocate a new ID and its response slot.
    pub fn register(&self) -> PendingCall<V> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel();
        self.slots.insert(id.clone(), tx);
        PendingCall {
            id,
            rx,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Deliver `value` to the waiter registered under `id`.
    ///
    /// Never blocks. Returns `false` when the ID is unknown, was already
    /// resolved, or its waiter has gone away.
    pub fn resolve(&self, id: &str, value: V) -> bool {
        match self.slots.remove(id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Number of calls still awaiting a reply.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

impl<V> Default for PendingCalls<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// The waiting side of one registered call.
#[derive(Debug)]
pub struct PendingCall<V> {
    id: String,
    rx: oneshot::Receiver<V>,
    slots: Slots<V>,
}

impl<V> PendingCall<V> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Wait for the reply. `None` if the slot was dropped unanswered.
    pub async fn recv(&mut self) -> Option<V> {
        (&mut self.rx).await.ok()
    }
}

impl<V> Drop for PendingCall<V> {
    fn drop(&mut self) {
        self.slots.remove(&self.id);
    }
}
