//! Typed publish/subscribe brokers.
//!
//! There is one [`Broker`] per payload type (sessions, messages, permission
//! requests, orchestrator events). Every subscriber owns a bounded queue.
//! Publishing never blocks: when a queue is full the oldest pending event is
//! evicted, except that `Deleted` events are evicted last so a deletion is
//! never lost while the matching creation is still queued.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

/// Default number of pending events a subscriber may hold.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 64;

/// What happened to the entity carried by an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Created,
    Updated,
    Deleted,
}

/// A published event: a type tag plus the entity snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<T> {
    pub kind: EventType,
    pub payload: T,
}

struct Queue<T> {
    events: Mutex<VecDeque<Event<T>>>,
    capacity: usize,
    notify: Notify,
    closed: AtomicBool,
    dropped: AtomicU64,
    cancel: CancellationToken,
}

impl<T> Queue<T> {
    fn lock(&self) -> MutexGuard<'_, VecDeque<Event<T>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, event: Event<T>) {
        {
            let mut events = self.lock();
            if events.len() >= self.capacity {
                let victim = events
                    .iter()
                    .position(|e| e.kind != EventType::Deleted)
                    .unwrap_or(0);
                events.remove(victim);
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.cancel.is_cancelled()
    }
}

struct BrokerInner<T> {
    subscribers: Mutex<HashMap<u64, Arc<Queue<T>>>>,
    next_id: AtomicU64,
    capacity: usize,
    shut_down: AtomicBool,
}

impl<T> BrokerInner<T> {
    fn lock(&self) -> MutexGuard<'_, HashMap<u64, Arc<Queue<T>>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A fan-out broker for one payload type.
///
/// Cloning a broker yields another handle to the same subscriber list.
pub struct Broker<T> {
    inner: Arc<BrokerInner<T>>,
}

impl<T> Clone for Broker<T> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Clone + Send + 'static> Broker<T> {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a broker whose subscribers each buffer at most `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                capacity: capacity.max(1),
                shut_down: AtomicBool::new(false),
            }),
        }
    }

    /// Register a subscriber. It is removed when `cancel` fires or the
    /// returned [`Subscription`] is dropped.
    pub fn subscribe(&self, cancel: CancellationToken) -> Subscription<T> {
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::with_capacity(self.inner.capacity)),
            capacity: self.inner.capacity,
            notify: Notify::new(),
            closed: AtomicBool::new(self.inner.shut_down.load(Ordering::Acquire)),
            dropped: AtomicU64::new(0),
            cancel,
        });
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        if !self.inner.shut_down.load(Ordering::Acquire) {
            self.inner.lock().insert(id, Arc::clone(&queue));
        }
        Subscription {
            id,
            queue,
            broker: Arc::downgrade(&self.inner),
        }
    }

    /// Fan `payload` out to every live subscriber without blocking.
    pub fn publish(&self, kind: EventType, payload: T) {
        let live: Vec<Arc<Queue<T>>> = {
            let mut subscribers = self.inner.lock();
            subscribers.retain(|_, q| q.is_live());
            subscribers.values().cloned().collect()
        };
        for queue in live {
            queue.push(Event {
                kind,
                payload: payload.clone(),
            });
        }
    }

    /// Number of currently registered subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.lock();
        subscribers.retain(|_, q| q.is_live());
        subscribers.len()
    }

    /// Close every subscription; later subscriptions start closed.
    pub fn shutdown(&self) {
        self.inner.shut_down.store(true, Ordering::Release);
        let drained: Vec<_> = self.inner.lock().drain().map(|(_, q)| q).collect();
        for queue in drained {
            queue.close();
        }
    }
}

impl<T: Clone + Send + 'static> Default for Broker<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// The receiving half of a broker subscription.
pub struct Subscription<T> {
    id: u64,
    queue: Arc<Queue<T>>,
    broker: Weak<BrokerInner<T>>,
}

impl<T> Subscription<T> {
    /// Wait for the next event. Returns `None` once the subscription is
    /// cancelled or the broker shuts down and the queue is drained.
    pub async fn recv(&mut self) -> Option<Event<T>> {
        loop {
            if let Some(event) = self.queue.lock().pop_front() {
                return Some(event);
            }
            if self.queue.closed.load(Ordering::Acquire) {
                return None;
            }
            tokio::select! {
                _ = self.queue.notify.notified() => {}
                _ = self.queue.cancel.cancelled() => {
                    self.queue.close();
                    return None;
                }
            }
        }
    }

    /// Take the next event if one is already queued.
    pub fn try_recv(&mut self) -> Option<Event<T>> {
        self.queue.lock().pop_front()
    }

    /// Events this subscriber lost to the drop-oldest policy.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.queue.close();
        if let Some(broker) = self.broker.upgrade() {
            broker.lock().remove(&self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn publish_reaches_every_subscriber() {
        let broker: Broker<String> = Broker::new();
        let mut a = broker.subscribe(CancellationToken::new());
        let mut b = broker.subscribe(CancellationToken::new());

        broker.publish(EventType::Created, "s1".to_string());

        let ea = a.recv().await.unwrap();
        let eb = b.recv().await.unwrap();
        assert_eq!(ea.kind, EventType::Created);
        assert_eq!(ea.payload, "s1");
        assert_eq!(eb.payload, "s1");
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        let broker: Broker<u32> = Broker::new();
        broker.publish(EventType::Updated, 7);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[test]
    fn slow_subscriber_drops_oldest() {
        let broker: Broker<u32> = Broker::with_capacity(3);
        let mut sub = broker.subscribe(CancellationToken::new());
        for i in 0..5 {
            broker.publish(EventType::Updated, i);
        }
        assert_eq!(sub.dropped(), 2);
        let seen: Vec<u32> = std::iter::from_fn(|| sub.try_recv().map(|e| e.payload)).collect();
        assert_eq!(seen, vec![2, 3, 4]);
    }

    #[test]
    fn deletes_are_evicted_last() {
        let broker: Broker<&'static str> = Broker::with_capacity(2);
        let mut sub = broker.subscribe(CancellationToken::new());
        broker.publish(EventType::Created, "a");
        broker.publish(EventType::Deleted, "a");
        broker.publish(EventType::Updated, "b");
        broker.publish(EventType::Updated, "c");

        let kinds: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| (e.kind, e.payload))
            .collect();
        assert_eq!(
            kinds,
            vec![(EventType::Deleted, "a"), (EventType::Updated, "c")]
        );
    }

    #[test]
    fn created_is_dropped_before_its_delete() {
        let broker: Broker<&'static str> = Broker::with_capacity(2);
        let mut sub = broker.subscribe(CancellationToken::new());
        broker.publish(EventType::Created, "x");
        broker.publish(EventType::Deleted, "x");
        broker.publish(EventType::Created, "y");

        let first = sub.try_recv().unwrap();
        assert_eq!((first.kind, first.payload), (EventType::Deleted, "x"));
    }

    #[tokio::test]
    async fn cancelled_subscriber_is_removed() {
        let broker: Broker<u32> = Broker::new();
        let cancel = CancellationToken::new();
        let mut sub = broker.subscribe(cancel.clone());
        assert_eq!(broker.subscriber_count(), 1);

        cancel.cancel();
        assert!(sub.recv().await.is_none());
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn dropped_subscription_unregisters() {
        let broker: Broker<u32> = Broker::new();
        let sub = broker.subscribe(CancellationToken::new());
        drop(sub);
        assert_eq!(broker.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let broker: Broker<u32> = Broker::new();
        let mut sub = broker.subscribe(CancellationToken::new());
        let publisher = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish(EventType::Created, 42);
        });
        let event = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.payload, 42);
    }

    #[tokio::test]
    async fn shutdown_closes_subscriptions() {
        let broker: Broker<u32> = Broker::new();
        let mut sub = broker.subscribe(CancellationToken::new());
        broker.publish(EventType::Created, 1);
        broker.shutdown();
        assert_eq!(sub.recv().await.map(|e| e.payload), Some(1));
        assert!(sub.recv().await.is_none());
    }
}
