//! Bounded, never-blocking queues with an explicit overflow policy.
//!
//! Every frame-bearing hop in the pipeline prefers freshness over completeness:
//! a producer must never stall because its consumer is slow. `QueueSender::offer`
//! therefore always returns immediately and reports what happened to the item.

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

/// What to do when an item is offered to a full queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Keep the queued items and discard the one being offered.
    DropNewest,
    /// Evict the oldest queued item to make room for the one being offered.
    DropOldest,
}

/// Outcome of a single `offer`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    Accepted,
    /// The queue was full and the offered item was discarded.
    DroppedNewest,
    /// The queue was full; the oldest item was evicted and the offered one queued.
    EvictedOldest,
    /// Every receiver is gone.
    Closed,
}

impl Offer {
    /// True when the offered item is now in the queue.
    pub fn is_queued(self) -> bool {
        matches!(self, Offer::Accepted | Offer::EvictedOldest)
    }
}

/// Producer end of a bounded queue.
///
/// Dropping every `QueueSender` closes the queue for its receivers.
pub struct QueueSender<T> {
    tx: Sender<T>,
    evict: Option<Receiver<T>>,
    policy: OverflowPolicy,
}

// Manual impl: cloning a sender must not require `T: Clone`.
impl<T> Clone for QueueSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            evict: self.evict.clone(),
            policy: self.policy,
        }
    }
}

impl<T> std::fmt::Debug for QueueSender<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueSender")
            .field("policy", &self.policy)
            .field("len", &self.tx.len())
            .field("capacity", &self.tx.capacity())
            .finish()
    }
}

/// Create a bounded queue.
///
/// A capacity of zero gives rendezvous semantics: an offer only succeeds when a
/// receiver is already waiting.
///
/// With `DropOldest` the sender keeps a receiver handle for eviction, so
/// `Offer::Closed` is never reported under that policy.
pub fn bounded_queue<T>(capacity: usize, policy: OverflowPolicy) -> (QueueSender<T>, Receiver<T>) {
    let (tx, rx) = bounded(capacity);
    let evict = match policy {
        OverflowPolicy::DropOldest => Some(rx.clone()),
        OverflowPolicy::DropNewest => None,
    };
    (QueueSender { tx, evict, policy }, rx)
}

impl<T> QueueSender<T> {
    /// Offer an item without blocking.
    pub fn offer(&self, item: T) -> Offer {
        let item = match self.tx.try_send(item) {
            Ok(()) => return Offer::Accepted,
            Err(TrySendError::Disconnected(_)) => return Offer::Closed,
            Err(TrySendError::Full(item)) => item,
        };

        let Some(evict) = &self.evict else {
            return Offer::DroppedNewest;
        };

        // A concurrent consumer may drain the slot first; either way one retry is enough.
        let _ = evict.try_recv();
        match self.tx.try_send(item) {
            Ok(()) => Offer::EvictedOldest,
            Err(TrySendError::Disconnected(_)) => Offer::Closed,
            Err(TrySendError::Full(_)) => Offer::DroppedNewest,
        }
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }

    pub fn capacity(&self) -> Option<usize> {
        self.tx.capacity()
    }
}
