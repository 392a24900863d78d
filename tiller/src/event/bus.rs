//! The event bus: typed fan-out with bounded memory.
//!
//! Publishing is non-blocking for the publisher except toward `Block`
//! subscribers (control-channel approval flows). A rolling history is
//! retained for replay to late subscribers, bounded by both count and
//! age; a background reaper evicts by whichever bound trips first.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::envelope::{EventEnvelope, EventPayload};
use super::subscription::{DropPolicy, SubscribeOptions, SubscriberQueue, Subscription};

/// Retention and delivery defaults for an [`EventBus`].
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Maximum retained envelopes.
    pub retention_count: usize,
    /// Maximum retained envelope age.
    pub retention_age: Duration,
    /// How often the reaper checks the bounds.
    pub reaper_interval: Duration,
    /// Default subscription queue capacity.
    pub default_buffer_size: usize,
    /// Default subscription drop policy.
    pub default_drop_policy: DropPolicy,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            retention_count: 10_000,
            retention_age: Duration::from_secs(3600),
            reaper_interval: Duration::from_secs(30),
            default_buffer_size: 256,
            default_drop_policy: DropPolicy::DropOldest,
        }
    }
}

struct BusInner {
    config: BusConfig,
    seq: AtomicI64,
    next_sub_id: AtomicU64,
    subscribers: Mutex<Vec<Arc<SubscriberQueue>>>,
    history: Mutex<VecDeque<EventEnvelope>>,
    closed: AtomicBool,
    reaper_started: AtomicBool,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl BusInner {
    fn evict(&self) {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.retention_age)
                .unwrap_or_else(|_| chrono::Duration::hours(1));
        let mut history = self.history.lock().expect("bus history poisoned");
        while history.len() > self.config.retention_count {
            history.pop_front();
        }
        while history.front().is_some_and(|env| env.timestamp < cutoff) {
            history.pop_front();
        }
    }
}

/// Fan-out hub for [`EventEnvelope`]s. Cheap to clone; all clones share
/// the same bus.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .field("retained", &self.retained())
            .field("closed", &self.inner.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

impl EventBus {
    /// Create a bus with the given retention and delivery defaults.
    #[must_use]
    pub fn new(config: BusConfig) -> Self {
        Self {
            inner: Arc::new(BusInner {
                config,
                seq: AtomicI64::new(0),
                next_sub_id: AtomicU64::new(1),
                subscribers: Mutex::new(Vec::new()),
                history: Mutex::new(VecDeque::new()),
                closed: AtomicBool::new(false),
                reaper_started: AtomicBool::new(false),
                reaper: Mutex::new(None),
            }),
        }
    }

    /// Next envelope sequence number. Monotonic per bus.
    fn next_seq(&self) -> i64 {
        self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Publish a typed payload on behalf of `agent_id`.
    ///
    /// Delivery to each subscriber follows that subscriber's drop policy;
    /// only `Block` subscribers can suspend the publisher. Publishing on
    /// a closed bus is a no-op and returns `None`.
    pub async fn publish(&self, agent_id: &str, payload: &EventPayload) -> Option<EventEnvelope> {
        if self.inner.closed.load(Ordering::SeqCst) {
            trace!(agent = agent_id, "publish on closed bus ignored");
            return None;
        }
        self.ensure_reaper();

        let envelope = EventEnvelope::new(agent_id, self.next_seq(), payload);

        {
            let mut history = self.inner.history.lock().expect("bus history poisoned");
            history.push_back(envelope.clone());
            while history.len() > self.inner.config.retention_count {
                history.pop_front();
            }
        }

        let targets: Vec<Arc<SubscriberQueue>> = {
            let mut subscribers = self.inner.subscribers.lock().expect("bus subscribers poisoned");
            subscribers.retain(|queue| !queue.is_closed());
            subscribers
                .iter()
                .filter(|queue| queue.filter.matches(&envelope))
                .map(Arc::clone)
                .collect()
        };

        for queue in targets {
            queue.deliver(envelope.clone()).await;
        }

        Some(envelope)
    }

    /// Allocate a filtered, bounded subscription.
    ///
    /// With `replay_from`, retained history matching the filter (at or
    /// after the given sequence) is preloaded into the queue before live
    /// delivery begins.
    #[must_use]
    pub fn subscribe(&self, options: SubscribeOptions) -> Subscription {
        let id = self.inner.next_sub_id.fetch_add(1, Ordering::SeqCst);
        let capacity = options
            .buffer_size
            .unwrap_or(self.inner.config.default_buffer_size);
        let policy = options
            .drop_policy
            .unwrap_or(self.inner.config.default_drop_policy);
        let queue = Arc::new(SubscriberQueue::new(id, options.filter, capacity, policy));

        if self.inner.closed.load(Ordering::SeqCst) {
            queue.close();
        } else {
            if let Some(from_seq) = options.replay_from {
                let history = self.inner.history.lock().expect("bus history poisoned");
                for envelope in history.iter() {
                    if envelope.seq >= from_seq && queue.filter.matches(envelope) {
                        queue.preload(envelope.clone());
                    }
                }
            }
            self.inner
                .subscribers
                .lock()
                .expect("bus subscribers poisoned")
                .push(Arc::clone(&queue));
        }

        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        Subscription {
            queue,
            on_close: Some(Box::new(move |sub_id| {
                if let Some(inner) = weak.upgrade() {
                    inner
                        .subscribers
                        .lock()
                        .expect("bus subscribers poisoned")
                        .retain(|q| q.id != sub_id);
                }
            })),
        }
    }

    /// Retained envelopes with `seq >= from_seq`, oldest first.
    #[must_use]
    pub fn history_since(&self, from_seq: i64) -> Vec<EventEnvelope> {
        self.inner
            .history
            .lock()
            .expect("bus history poisoned")
            .iter()
            .filter(|env| env.seq >= from_seq)
            .cloned()
            .collect()
    }

    /// Number of retained envelopes.
    #[must_use]
    pub fn retained(&self) -> usize {
        self.inner.history.lock().expect("bus history poisoned").len()
    }

    /// Returns `true` if any active subscription can receive envelopes
    /// on `channel`.
    #[must_use]
    pub fn has_subscriber_on(&self, channel: super::envelope::Channel) -> bool {
        let mut subscribers = self.inner.subscribers.lock().expect("bus subscribers poisoned");
        subscribers.retain(|queue| !queue.is_closed());
        subscribers.iter().any(|queue| {
            queue.filter.channels.is_empty() || queue.filter.channels.contains(&channel)
        })
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.inner.subscribers.lock().expect("bus subscribers poisoned");
        subscribers.retain(|queue| !queue.is_closed());
        subscribers.len()
    }

    /// Returns `true` once [`EventBus::close`] has run.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Close the bus: stop the reaper, close every subscription, and
    /// release retained history. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("closing event bus");

        if let Some(handle) = self.inner.reaper.lock().expect("bus reaper poisoned").take() {
            handle.abort();
        }

        let subscribers: Vec<Arc<SubscriberQueue>> = {
            let mut guard = self.inner.subscribers.lock().expect("bus subscribers poisoned");
            std::mem::take(&mut *guard)
        };
        for queue in subscribers {
            queue.close();
        }

        self.inner.history.lock().expect("bus history poisoned").clear();
    }

    /// Spawn the retention reaper on first use inside a runtime.
    fn ensure_reaper(&self) {
        if self.inner.reaper_started.swap(true, Ordering::SeqCst) {
            return;
        }
        let weak: Weak<BusInner> = Arc::downgrade(&self.inner);
        let interval = self.inner.config.reaper_interval;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.closed.load(Ordering::SeqCst) {
                    break;
                }
                inner.evict();
            }
        });
        *self.inner.reaper.lock().expect("bus reaper poisoned") = Some(handle);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::event::envelope::Channel;
    use crate::event::subscription::SubscriptionFilter;

    fn text(text: &str) -> EventPayload {
        EventPayload::TextChunk { text: text.into() }
    }

    #[tokio::test]
    async fn publish_then_receive() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscribeOptions::all());

        bus.publish("agent", &text("hello")).await.unwrap();

        let envelope = sub.recv().await.unwrap();
        assert_eq!(envelope.event_type, "text-chunk");
        assert_eq!(envelope.agent_id, "agent");
        assert_eq!(envelope.seq, 1);
    }

    #[tokio::test]
    async fn multiple_subscribers_all_receive() {
        let bus = EventBus::default();
        let mut a = bus.subscribe(SubscribeOptions::all());
        let mut b = bus.subscribe(SubscribeOptions::all());

        bus.publish("agent", &text("x")).await.unwrap();

        assert_eq!(a.recv().await.unwrap().seq, 1);
        assert_eq!(b.recv().await.unwrap().seq, 1);
    }

    #[tokio::test]
    async fn filter_limits_delivery() {
        let bus = EventBus::default();
        let mut monitor_only = bus.subscribe(SubscribeOptions::channels([Channel::Monitor]));

        bus.publish("agent", &text("skip me")).await.unwrap();
        bus.publish(
            "agent",
            &EventPayload::Error {
                message: "boom".into(),
                fatal: false,
            },
        )
        .await
        .unwrap();

        let envelope = monitor_only.recv().await.unwrap();
        assert_eq!(envelope.event_type, "error");
        assert_eq!(monitor_only.buffered(), 0);
    }

    #[tokio::test]
    async fn per_subscriber_order_is_publish_order() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscribeOptions::all());

        for i in 0..10 {
            bus.publish("agent", &text(&format!("m{i}"))).await.unwrap();
        }
        for i in 1..=10 {
            assert_eq!(sub.recv().await.unwrap().seq, i);
        }
    }

    #[tokio::test]
    async fn replay_preloads_matching_history() {
        let bus = EventBus::default();
        bus.publish("agent", &text("one")).await.unwrap();
        bus.publish("agent", &text("two")).await.unwrap();
        bus.publish("agent", &text("three")).await.unwrap();

        let mut late = bus.subscribe(SubscribeOptions {
            replay_from: Some(2),
            ..SubscribeOptions::all()
        });
        assert_eq!(late.recv().await.unwrap().seq, 2);
        assert_eq!(late.recv().await.unwrap().seq, 3);
    }

    #[tokio::test]
    async fn history_bounded_by_count() {
        let bus = EventBus::new(BusConfig {
            retention_count: 3,
            ..BusConfig::default()
        });
        for i in 0..10 {
            bus.publish("agent", &text(&format!("m{i}"))).await.unwrap();
        }
        assert_eq!(bus.retained(), 3);
        let seqs: Vec<i64> = bus.history_since(0).iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![8, 9, 10]);
    }

    #[tokio::test]
    async fn close_empties_bus() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscribeOptions::all());
        bus.publish("agent", &text("x")).await.unwrap();

        bus.close().await;

        assert_eq!(bus.retained(), 0);
        assert_eq!(bus.subscriber_count(), 0);
        // Drain whatever was delivered before close, then observe EOF.
        while sub.recv().await.is_some() {}
        assert!(bus.publish("agent", &text("y")).await.is_none());
    }

    #[tokio::test]
    async fn subscription_close_deregisters() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscribeOptions::all());
        assert_eq!(bus.subscriber_count(), 1);
        sub.close();
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn drop_deregisters_too() {
        let bus = EventBus::default();
        {
            let _sub = bus.subscribe(SubscribeOptions::all());
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn subscription_adapts_to_a_stream() {
        use futures::StreamExt as _;

        let bus = EventBus::default();
        let sub = bus.subscribe(SubscribeOptions::all());
        bus.publish("agent", &text("a")).await.unwrap();
        bus.publish("agent", &text("b")).await.unwrap();

        let envelopes: Vec<_> = sub.into_stream().take(2).collect().await;
        assert_eq!(envelopes[0].seq, 1);
        assert_eq!(envelopes[1].seq, 2);
    }

    #[tokio::test]
    async fn subscribe_after_close_is_closed() {
        let bus = EventBus::default();
        bus.close().await;
        let mut sub = bus.subscribe(SubscribeOptions::all());
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn contiguous_subsequence_under_filter() {
        let bus = EventBus::default();
        let mut sub = bus.subscribe(SubscribeOptions {
            filter: SubscriptionFilter::all().with_event_types(["text-chunk"]),
            ..SubscribeOptions::all()
        });

        bus.publish("agent", &text("a")).await.unwrap();
        bus.publish(
            "agent",
            &EventPayload::StateChanged {
                from: "thinking".into(),
                to: "ready".into(),
            },
        )
        .await
        .unwrap();
        bus.publish("agent", &text("b")).await.unwrap();

        // Delivered envelopes are exactly the matching ones, in order.
        assert_eq!(sub.recv().await.unwrap().seq, 1);
        assert_eq!(sub.recv().await.unwrap().seq, 3);
    }
}
