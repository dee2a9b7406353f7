//! Live fan-out to connected viewers
//!
//! Every subscriber owns a bounded queue. Publishing never waits on a slow
//! viewer: when a queue is full the payload is dropped for that subscriber only,
//! and a closed queue is pruned from the registry.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info};

/// Wire payload shared between all subscriber queues
pub type Payload = Arc<str>;

/// Default per-subscriber queue depth
pub const DEFAULT_QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end handed to a viewer
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    receiver: mpsc::Receiver<Payload>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Next payload, or `None` once the hub has unsubscribed this viewer
    pub async fn recv(&mut self) -> Option<Payload> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Option<Payload> {
        self.receiver.try_recv().ok()
    }
}

/// Result of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub dropped: usize,
}

#[derive(Debug)]
pub struct BroadcastHub {
    capacity: usize,
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<SubscriberId, mpsc::Sender<Payload>>>,
    dropped_total: AtomicU64,
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

impl BroadcastHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(HashMap::new()),
            dropped_total: AtomicU64::new(0),
        }
    }

    /// Register a viewer. Payloads published after this call are queued for it.
    pub fn subscribe(&self) -> Subscription {
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (sender, receiver) = mpsc::channel(self.capacity);
        let count = {
            let mut subscribers = self.lock();
            subscribers.insert(id, sender);
            subscribers.len()
        };
        debug!(subscriber = %id, subscribers = count, "Subscriber registered");
        Subscription { id, receiver }
    }

    /// Remove a viewer and close its queue
    ///
    /// Returns `false` when the viewer was already gone, so repeated calls are harmless.
    pub fn unsubscribe(&self, id: SubscriberId) -> bool {
        let removed = self.lock().remove(&id).is_some();
        if removed {
            debug!(subscriber = %id, "Subscriber removed");
        }
        removed
    }

    /// Offer `payload` to every subscriber without blocking
    pub fn publish(&self, payload: Payload) -> PublishReport {
        // Snapshot so the registry lock is not held while offering
        let targets: Vec<(SubscriberId, mpsc::Sender<Payload>)> = self
            .lock()
            .iter()
            .map(|(id, sender)| (*id, sender.clone()))
            .collect();

        let mut report = PublishReport::default();
        let mut closed = Vec::new();
        for (id, sender) in targets {
            match sender.try_send(payload.clone()) {
                Ok(()) => report.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    report.dropped += 1;
                    debug!(subscriber = %id, "Subscriber queue full, dropping payload");
                }
                Err(TrySendError::Closed(_)) => closed.push(id),
            }
        }

        if report.dropped > 0 {
            self.dropped_total.fetch_add(report.dropped as u64, Ordering::Relaxed);
        }
        if !closed.is_empty() {
            let mut subscribers = self.lock();
            for id in closed {
                subscribers.remove(&id);
            }
        }
        report
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().len()
    }

    /// Payloads dropped for full queues since startup
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    /// Unsubscribe everyone; used at shutdown
    pub fn close_all(&self) -> usize {
        let closed = {
            let mut subscribers = self.lock();
            let count = subscribers.len();
            subscribers.clear();
            count
        };
        info!("Broadcast hub closed {} subscribers", closed);
        closed
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SubscriberId, mpsc::Sender<Payload>>> {
        self.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(text: &str) -> Payload {
        Arc::from(text)
    }

    #[tokio::test]
    async fn test_publish_reaches_every_subscriber_in_order() {
        let hub = BroadcastHub::new(8);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        hub.publish(payload("one"));
        let report = hub.publish(payload("two"));
        assert_eq!(report, PublishReport { delivered: 2, dropped: 0 });

        for sub in [&mut a, &mut b] {
            assert_eq!(sub.recv().await.as_deref(), Some("one"));
            assert_eq!(sub.recv().await.as_deref(), Some("two"));
        }
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_without_blocking_others() {
        let hub = BroadcastHub::new(2);
        let mut slow = hub.subscribe();
        let mut fast = hub.subscribe();

        for i in 0..5 {
            hub.publish(payload(&format!("m{}", i)));
            assert_eq!(fast.recv().await.as_deref(), Some(format!("m{}", i).as_str()));
        }

        // Only the first two fit in the slow queue
        assert_eq!(slow.try_recv().as_deref(), Some("m0"));
        assert_eq!(slow.try_recv().as_deref(), Some("m1"));
        assert!(slow.try_recv().is_none());
        assert_eq!(hub.dropped_total(), 3);
        assert_eq!(hub.subscriber_count(), 2);
    }

    #[tokio::test]
    async fn test_unsubscribe_is_idempotent_and_closes_queue() {
        let hub = BroadcastHub::new(4);
        let mut sub = hub.subscribe();
        let id = sub.id();

        assert!(hub.unsubscribe(id));
        assert!(!hub.unsubscribe(id));
        assert_eq!(hub.subscriber_count(), 0);
        assert!(sub.recv().await.is_none());

        let report = hub.publish(payload("after"));
        assert_eq!(report.delivered, 0);
    }

    #[tokio::test]
    async fn test_dropped_receiver_is_pruned_on_publish() {
        let hub = BroadcastHub::new(4);
        let sub = hub.subscribe();
        let _keep = hub.subscribe();
        drop(sub);

        let report = hub.publish(payload("x"));
        assert_eq!(report.delivered, 1);
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn test_close_all_ends_every_subscription() {
        let hub = BroadcastHub::new(4);
        let mut a = hub.subscribe();
        let mut b = hub.subscribe();

        assert_eq!(hub.close_all(), 2);
        assert!(a.recv().await.is_none());
        assert!(b.recv().await.is_none());
    }

    #[test]
    fn test_subscriber_ids_are_unique() {
        let hub = BroadcastHub::default();
        let a = hub.subscribe();
        let b = hub.subscribe();
        assert_ne!(a.id(), b.id());
    }
}
