use crate::downloads::{StatusMap, StatusStore};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};

/// One fan-out payload: the full status map as of a publish.
#[derive(Clone, Debug)]
pub struct StatusUpdate {
    pub seq: u64,
    pub statuses: Arc<StatusMap>,
}

#[derive(Debug, Default)]
struct Registry {
    next_id: u64,
    last_seq: u64,
    subscribers: HashMap<u64, mpsc::Sender<StatusUpdate>>,
}

/// Broadcasts store changes to every registered subscriber.
///
/// Each subscriber owns a bounded queue. Publishing never waits: a
/// subscriber whose queue is full is removed from the registry and its
/// stream ends, leaving everyone else untouched.
#[derive(Clone, Debug)]
pub struct ChangeNotifier {
    registry: Arc<Mutex<Registry>>,
    buffer: usize,
}

impl ChangeNotifier {
    pub fn new(buffer: usize) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
            buffer: buffer.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Delivers `statuses` to all current subscribers and returns the
    /// sequence number assigned to this publish.
    pub fn publish(&self, statuses: StatusMap) -> u64 {
        let statuses = Arc::new(statuses);
        let mut registry = self.lock();
        registry.last_seq += 1;
        let update = StatusUpdate {
            seq: registry.last_seq,
            statuses,
        };

        registry
            .subscribers
            .retain(|id, tx| match tx.try_send(update.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    warn!(subscriber = id, seq = update.seq, "Subscriber lagging, dropping it");
                    false
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(subscriber = id, "Subscriber gone, removing it");
                    false
                }
            });

        debug!(
            seq = update.seq,
            subscribers = registry.subscribers.len(),
            downloads = update.statuses.len(),
            "Published status update"
        );
        update.seq
    }

    /// Registers a subscriber that sees only publishes made from now on.
    pub fn subscribe(&self) -> Subscription {
        let mut registry = self.lock();
        self.register(&mut registry).1
    }

    /// Registers a subscriber and queues the current store contents as its
    /// first item. The snapshot is taken while the registry is locked, so
    /// no publish older than it can be delivered afterwards.
    pub fn subscribe_primed(&self, store: &StatusStore) -> Subscription {
        let mut registry = self.lock();
        let (tx, subscription) = self.register(&mut registry);
        let prime = StatusUpdate {
            seq: registry.last_seq,
            statuses: Arc::new(store.snapshot()),
        };
        // A fresh queue always has room for one item.
        let _ = tx.try_send(prime);
        subscription
    }

    fn register(&self, registry: &mut Registry) -> (mpsc::Sender<StatusUpdate>, Subscription) {
        let (tx, rx) = mpsc::channel(self.buffer);
        registry.next_id += 1;
        let id = registry.next_id;
        registry.subscribers.insert(id, tx.clone());
        debug!(subscriber = id, total = registry.subscribers.len(), "Subscriber registered");

        let subscription = Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        };
        (tx, subscription)
    }

    /// Removes a subscriber. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: u64) -> bool {
        let removed = self.lock().subscribers.remove(&id).is_some();
        if removed {
            debug!(subscriber = id, "Subscriber unregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().subscribers.len()
    }
}

/// Receiving end of a registration. Dropping it unregisters.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<StatusUpdate>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next update, or `None` once unsubscribed (or dropped for lagging)
    /// and the queue is drained.
    pub async fn recv(&mut self) -> Option<StatusUpdate> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .remove(&self.id);
        }
    }
}
