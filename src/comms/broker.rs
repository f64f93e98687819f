//! Fan-out broker between telemetry producers and streaming subscribers.
//!
//! Every subscriber owns a private bounded queue. `publish` places a shared
//! reference to the event into each queue registered for the event's topic,
//! so N subscribers each see every event instead of competing for it. A full
//! queue evicts its oldest entry.

use futures::Stream;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::transport::{TelemetryEvent, Topic};

/// Per-subscriber delivery queue. Written by publishers, read by one subscriber.
#[derive(Debug)]
struct SubscriberQueue {
    events: Mutex<VecDeque<Arc<TelemetryEvent>>>,
    notify: Notify,
    capacity: usize,
    dropped: AtomicU64,
    closed: AtomicBool,
}

impl SubscriberQueue {
    fn new(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            capacity: capacity.max(1),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns true if an older event was evicted to make room.
    fn push(&self, event: Arc<TelemetryEvent>) -> bool {
        let evicted = {
            let mut events = self.events.lock().unwrap_or_else(PoisonError::into_inner);
            let evicted = if events.len() >= self.capacity {
                events.pop_front();
                true
            } else {
                false
            };
            events.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.notify.notify_one();
        evicted
    }

    fn pop(&self) -> Option<Arc<TelemetryEvent>> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Live subscriber set for a single topic.
#[derive(Debug)]
struct TopicRegistry {
    topic: Topic,
    subscribers: RwLock<HashMap<u64, Arc<SubscriberQueue>>>,
}

impl TopicRegistry {
    fn new(topic: Topic) -> Self {
        Self {
            topic,
            subscribers: RwLock::new(HashMap::new()),
        }
    }

    fn unregister(&self, id: u64) {
        let removed = self
            .subscribers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        if removed.is_some() {
            debug!(topic = %self.topic, subscriber = id, "subscriber detached");
        }
    }
}

/// Owns the per-topic subscriber registries.
///
/// Constructed once at startup and shared behind an `Arc`; [`Broker::close`]
/// tears every live subscription down without draining pending events.
#[derive(Debug)]
pub struct Broker {
    logs: Arc<TopicRegistry>,
    stats: Arc<TopicRegistry>,
    capacity: usize,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl Broker {
    /// `capacity` bounds each subscriber's queue.
    pub fn new(capacity: usize) -> Self {
        Self {
            logs: Arc::new(TopicRegistry::new(Topic::Logs)),
            stats: Arc::new(TopicRegistry::new(Topic::Stats)),
            capacity: capacity.max(1),
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn registry(&self, topic: Topic) -> &Arc<TopicRegistry> {
        match topic {
            Topic::Logs => &self.logs,
            Topic::Stats => &self.stats,
        }
    }

    /// Deliver `event` to every subscriber currently attached to its topic.
    ///
    /// Returns the number of subscribers it was queued for.
    pub fn publish(&self, event: TelemetryEvent) -> usize {
        if self.is_closed() {
            return 0;
        }
        let registry = self.registry(event.topic());
        let event = Arc::new(event);

        let subscribers = registry
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        for (id, queue) in subscribers.iter() {
            if queue.push(event.clone()) {
                debug!(topic = %registry.topic, subscriber = id, "subscriber queue full, dropped oldest event");
            }
        }
        subscribers.len()
    }

    /// Attach a new subscriber to `topic`. It sees only events published
    /// after this call; dropping the returned handle detaches it.
    pub fn subscribe(&self, topic: Topic) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let registry = self.registry(topic).clone();
        let queue = Arc::new(SubscriberQueue::new(self.capacity));

        {
            let mut subscribers = registry
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            // Checked under the registry lock so `close` cannot miss us.
            if self.is_closed() {
                queue.close();
            } else {
                subscribers.insert(id, queue.clone());
                debug!(topic = %topic, subscriber = id, total = subscribers.len(), "subscriber attached");
            }
        }

        Subscription {
            id,
            topic,
            queue,
            registry,
        }
    }

    pub fn subscriber_count(&self, topic: Topic) -> usize {
        self.registry(topic)
            .subscribers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// End every live subscription and refuse new ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        for topic in Topic::ALL {
            let drained: Vec<_> = self
                .registry(topic)
                .subscribers
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .drain()
                .collect();
            for (_, queue) in &drained {
                queue.close();
            }
            info!(topic = %topic, subscribers = drained.len(), "broker topic closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// A single subscriber's view of one topic.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    topic: Topic,
    queue: Arc<SubscriberQueue>,
    registry: Arc<TopicRegistry>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Next event in publish order; `None` once the broker is closed.
    pub async fn recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        loop {
            if self.queue.is_closed() {
                return None;
            }
            if let Some(event) = self.queue.pop() {
                return Some(event);
            }
            self.queue.notify.notified().await;
        }
    }

    pub fn try_recv(&mut self) -> Option<Arc<TelemetryEvent>> {
        if self.queue.is_closed() {
            return None;
        }
        self.queue.pop()
    }

    /// Events evicted from this subscriber's queue because it fell behind.
    pub fn dropped(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }

    /// Lazy, non-restartable stream that ends when the broker closes.
    pub fn into_stream(self) -> impl Stream<Item = Arc<TelemetryEvent>> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let event = sub.recv().await?;
            Some((event, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registry.unregister(self.id);
    }
}
