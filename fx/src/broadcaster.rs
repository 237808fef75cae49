//! Fan-out of rate snapshots to subscriber queues.

use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};
use uuid::Uuid;

use crate::snapshot::ExchangeRateSnapshot;

/// Identity of one subscriber (e.g. one websocket connection).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(Uuid);

impl SubscriberId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Registry = DashMap<SubscriberId, mpsc::Sender<Arc<ExchangeRateSnapshot>>>;

/// Registry of bounded subscriber queues.
///
/// Kept separate from the rate cache: a stalled subscriber can only fill
/// its own queue, it never holds a lock the refresh loop needs.
pub struct Broadcaster {
    subscribers: Arc<Registry>,
    buffer: usize,
}

impl Broadcaster {
    /// Create a broadcaster whose queues hold `buffer` pending snapshots.
    pub fn new(buffer: usize) -> Self {
        Self {
            subscribers: Arc::new(DashMap::new()),
            buffer: buffer.max(1),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.buffer);
        let id = SubscriberId::new();
        self.subscribers.insert(id, tx);

        info!(subscriber = %id, total = self.subscribers.len(), "Subscriber added");

        Subscription {
            id,
            receiver: rx,
            registry: Arc::downgrade(&self.subscribers),
        }
    }

    /// Remove a subscriber and close its queue.
    ///
    /// Safe to call repeatedly and with unread snapshots still queued; the
    /// receiver drains what is left and then sees the end of the stream.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.remove(&id).is_some();
        if removed {
            info!(subscriber = %id, total = self.subscribers.len(), "Subscriber removed");
        }
        removed
    }

    /// Number of registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Offer a snapshot to every subscriber without waiting on any of them.
    pub fn broadcast(&self, snapshot: &Arc<ExchangeRateSnapshot>) -> BroadcastReport {
        let mut report = BroadcastReport::default();
        let mut closed = Vec::new();

        for entry in self.subscribers.iter() {
            match entry.value().try_send(Arc::clone(snapshot)) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    debug!(subscriber = %entry.key(), "Subscriber lagging, snapshot skipped");
                    report.lagged += 1;
                }
                Err(TrySendError::Closed(_)) => closed.push(*entry.key()),
            }
        }

        // Removal must happen after the iterator releases its shard locks.
        for id in closed {
            self.subscribers.remove(&id);
            report.closed += 1;
        }

        report
    }
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::new(tradewallet_common::limits::SUBSCRIBER_BUFFER)
    }
}

/// Outcome of one broadcast round.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Queued successfully.
    pub delivered: usize,
    /// Queue full; this round skipped for that subscriber.
    pub lagged: usize,
    /// Queue closed; subscriber pruned.
    pub closed: usize,
}

/// Receiving end handed to one subscriber.
///
/// Dropping it unregisters the subscriber.
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Arc<ExchangeRateSnapshot>>,
    registry: Weak<Registry>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Wait for the next pushed snapshot; `None` once unsubscribed and drained.
    pub async fn recv(&mut self) -> Option<Arc<ExchangeRateSnapshot>> {
        self.receiver.recv().await
    }

    /// Take a queued snapshot without waiting.
    pub fn try_recv(&mut self) -> Option<Arc<ExchangeRateSnapshot>> {
        self.receiver.try_recv().ok()
    }

    /// Stop accepting new snapshots; queued ones can still be drained.
    pub fn close(&mut self) {
        self.receiver.close();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(&self.id);
        }
    }
}
