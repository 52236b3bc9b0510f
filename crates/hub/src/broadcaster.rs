//! Fan-out of broadcast messages into per-subscriber bounded queues.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use kuyala_core::BroadcastMessage;
use metrics::{counter, gauge};
use rustc_hash::FxHashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use uuid::Uuid;

/// Per-subscriber inbound queue capacity.
pub const SUBSCRIBER_QUEUE_CAPACITY: usize = 50;

pub type SubscriberId = Uuid;

/// Messages are shared between subscribers; each queue holds a reference.
pub type Shared = Arc<BroadcastMessage>;

/// Receiving half handed to a newly registered subscriber.
pub struct Subscription {
    pub id: SubscriberId,
    pub inbound: mpsc::Receiver<Shared>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

/// Registry of live subscribers.
///
/// The registry lock is held only for register, deregister and the
/// non-blocking enqueue loop in `publish`, so no caller ever waits on a
/// subscriber.
pub struct Broadcaster {
    subscribers: Mutex<FxHashMap<SubscriberId, mpsc::Sender<Shared>>>,
    capacity: usize,
}

impl Default for Broadcaster {
    fn default() -> Self {
        Self::with_capacity(SUBSCRIBER_QUEUE_CAPACITY)
    }
}

impl Broadcaster {
    pub fn with_capacity(capacity: usize) -> Self {
        Self { subscribers: Mutex::new(FxHashMap::default()), capacity: capacity.max(1) }
    }

    fn lock(&self) -> MutexGuard<'_, FxHashMap<SubscriberId, mpsc::Sender<Shared>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn register(&self) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let count = {
            let mut subs = self.lock();
            subs.insert(id, tx);
            subs.len()
        };
        gauge!("kuyala_subscribers", count as f64);
        debug!(client = %id, subscribers = count, "subscriber registered");
        Subscription { id, inbound: rx }
    }

    /// Remove a subscriber. Returns whether it was present; removing an
    /// unknown id is a no-op.
    pub fn deregister(&self, id: SubscriberId) -> bool {
        let (removed, count) = {
            let mut subs = self.lock();
            let removed = subs.remove(&id).is_some();
            (removed, subs.len())
        };
        if removed {
            gauge!("kuyala_subscribers", count as f64);
            debug!(client = %id, subscribers = count, "subscriber deregistered");
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Offer a message to every registered subscriber without waiting.
    /// A full queue loses this message for that subscriber only.
    pub fn publish(&self, msg: BroadcastMessage) -> PublishReport {
        let event = msg.event_name();
        let msg = Arc::new(msg);
        let mut report = PublishReport::default();
        {
            let subs = self.lock();
            for (id, tx) in subs.iter() {
                match tx.try_send(Arc::clone(&msg)) {
                    Ok(()) => report.delivered += 1,
                    Err(TrySendError::Full(_)) => {
                        report.dropped += 1;
                        warn!(client = %id, event = %event, "subscriber queue full; message dropped");
                    }
                    Err(TrySendError::Closed(_)) => {
                        report.dropped += 1;
                        debug!(client = %id, event = %event, "subscriber closing; message dropped");
                    }
                }
            }
        }
        counter!("kuyala_broadcast_published_total", 1);
        if report.dropped > 0 {
            counter!("kuyala_broadcast_dropped_total", report.dropped as u64);
        }
        report
    }
}

/// Keeps a subscriber registered until released or dropped.
///
/// Deregistration happens exactly once, either through [`Registration::release`]
/// or on drop, which also covers aborted tasks.
pub struct Registration {
    id: SubscriberId,
    broadcaster: Arc<Broadcaster>,
    active: bool,
}

impl Registration {
    pub fn new(broadcaster: Arc<Broadcaster>) -> (Self, mpsc::Receiver<Shared>) {
        let Subscription { id, inbound } = broadcaster.register();
        (Self { id, broadcaster, active: true }, inbound)
    }

    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn release(&mut self) {
        if std::mem::replace(&mut self.active, false) {
            self.broadcaster.deregister(self.id);
        }
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.release();
    }
}
