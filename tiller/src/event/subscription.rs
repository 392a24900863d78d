//! Subscriptions: a consumer's filtered, bounded view of the bus.

use std::collections::BTreeSet;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

use super::envelope::{Channel, EventEnvelope};
use crate::stream::{self, Reader};

/// What a subscriber's queue does when it is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DropPolicy {
    /// Publisher awaits capacity. Reserved for control-channel approval
    /// flows where loss is unacceptable.
    Block,
    /// Ring-buffer semantics; the default for progress.
    #[default]
    DropOldest,
    /// Keep history, sacrifice recency; used for slow monitor consumers.
    DropNewest,
}

/// Predicate deciding which envelopes a subscription receives.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionFilter {
    /// Channels to receive. Empty means all channels.
    pub channels: BTreeSet<Channel>,
    /// Event type names to receive. `None` means all types.
    pub event_types: Option<BTreeSet<String>>,
    /// Payload tags to receive. `None` means no tag filtering.
    pub tags: Option<BTreeSet<String>>,
}

impl SubscriptionFilter {
    /// A filter receiving everything.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// A filter for the given channels only.
    #[must_use]
    pub fn channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            channels: channels.into_iter().collect(),
            ..Self::default()
        }
    }

    /// Restrict to the given event type names.
    #[must_use]
    pub fn with_event_types<S: Into<String>>(
        mut self,
        types: impl IntoIterator<Item = S>,
    ) -> Self {
        self.event_types = Some(types.into_iter().map(Into::into).collect());
        self
    }

    /// Restrict to envelopes carrying at least one of the given tags.
    #[must_use]
    pub fn with_tags<S: Into<String>>(mut self, tags: impl IntoIterator<Item = S>) -> Self {
        self.tags = Some(tags.into_iter().map(Into::into).collect());
        self
    }

    /// Returns `true` if the envelope passes this filter.
    #[must_use]
    pub fn matches(&self, envelope: &EventEnvelope) -> bool {
        if !self.channels.is_empty() && !self.channels.contains(&envelope.channel) {
            return false;
        }
        if let Some(types) = &self.event_types {
            if !types.contains(&envelope.event_type) {
                return false;
            }
        }
        if let Some(tags) = &self.tags {
            let payload_tags = envelope.payload_tags();
            if !payload_tags.iter().any(|t| tags.contains(*t)) {
                return false;
            }
        }
        true
    }
}

/// Options for [`EventBus::subscribe`](super::bus::EventBus::subscribe).
#[derive(Debug, Clone)]
pub struct SubscribeOptions {
    /// Envelope filter.
    pub filter: SubscriptionFilter,
    /// Bounded queue capacity. `None` uses the bus default.
    pub buffer_size: Option<usize>,
    /// Behavior when the queue is full. `None` uses the bus default.
    pub drop_policy: Option<DropPolicy>,
    /// Replay retained history starting at this sequence number.
    pub replay_from: Option<i64>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            filter: SubscriptionFilter::all(),
            buffer_size: None,
            drop_policy: None,
            replay_from: None,
        }
    }
}

impl SubscribeOptions {
    /// Subscribe to everything with bus defaults.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Subscribe to the given channels with bus defaults.
    #[must_use]
    pub fn channels(channels: impl IntoIterator<Item = Channel>) -> Self {
        Self {
            filter: SubscriptionFilter::channels(channels),
            ..Self::default()
        }
    }
}

struct QueueInner {
    items: VecDeque<EventEnvelope>,
    closed: bool,
}

/// The delivery queue shared between the bus and one subscription.
pub(crate) struct SubscriberQueue {
    pub(crate) id: u64,
    pub(crate) filter: SubscriptionFilter,
    capacity: usize,
    policy: DropPolicy,
    inner: Mutex<QueueInner>,
    readable: Notify,
    writable: Notify,
    closed_flag: AtomicBool,
}

impl SubscriberQueue {
    pub(crate) fn new(
        id: u64,
        filter: SubscriptionFilter,
        capacity: usize,
        policy: DropPolicy,
    ) -> Self {
        Self {
            id,
            filter,
            capacity: capacity.max(1),
            policy,
            inner: Mutex::new(QueueInner {
                items: VecDeque::new(),
                closed: false,
            }),
            readable: Notify::new(),
            writable: Notify::new(),
            closed_flag: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed_flag.load(Ordering::SeqCst)
    }

    /// Deliver one envelope under this queue's drop policy. Only the
    /// `Block` policy can suspend the caller.
    pub(crate) async fn deliver(&self, envelope: EventEnvelope) {
        match self.policy {
            DropPolicy::Block => loop {
                let writable = self.writable.notified();
                tokio::pin!(writable);
                writable.as_mut().enable();
                {
                    let mut inner = self.inner.lock().expect("subscriber queue poisoned");
                    if inner.closed {
                        return;
                    }
                    if inner.items.len() < self.capacity {
                        inner.items.push_back(envelope);
                        self.readable.notify_one();
                        return;
                    }
                }
                writable.await;
            },
            DropPolicy::DropOldest => {
                let mut inner = self.inner.lock().expect("subscriber queue poisoned");
                if inner.closed {
                    return;
                }
                if inner.items.len() >= self.capacity {
                    inner.items.pop_front();
                }
                inner.items.push_back(envelope);
                self.readable.notify_one();
            }
            DropPolicy::DropNewest => {
                let mut inner = self.inner.lock().expect("subscriber queue poisoned");
                if inner.closed || inner.items.len() >= self.capacity {
                    return;
                }
                inner.items.push_back(envelope);
                self.readable.notify_one();
            }
        }
    }

    /// Preload a replayed envelope. Always ring-buffers: replay is
    /// best-effort and must not suspend the subscriber setup path.
    pub(crate) fn preload(&self, envelope: EventEnvelope) {
        let mut inner = self.inner.lock().expect("subscriber queue poisoned");
        if inner.closed {
            return;
        }
        if inner.items.len() >= self.capacity {
            inner.items.pop_front();
        }
        inner.items.push_back(envelope);
        self.readable.notify_one();
    }

    pub(crate) async fn recv(&self) -> Option<EventEnvelope> {
        loop {
            let readable = self.readable.notified();
            tokio::pin!(readable);
            readable.as_mut().enable();
            {
                let mut inner = self.inner.lock().expect("subscriber queue poisoned");
                if let Some(envelope) = inner.items.pop_front() {
                    self.writable.notify_one();
                    return Some(envelope);
                }
                if inner.closed {
                    return None;
                }
            }
            readable.await;
        }
    }

    pub(crate) fn close(&self) {
        self.closed_flag.store(true, Ordering::SeqCst);
        let mut inner = self.inner.lock().expect("subscriber queue poisoned");
        inner.closed = true;
        inner.items.clear();
        drop(inner);
        self.readable.notify_waiters();
        self.writable.notify_waiters();
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().expect("subscriber queue poisoned").items.len()
    }
}

/// A consumer's handle on the bus. Dropping or closing it releases the
/// delivery queue; callers must close subscriptions they no longer need.
pub struct Subscription {
    pub(crate) queue: Arc<SubscriberQueue>,
    pub(crate) on_close: Option<Box<dyn FnOnce(u64) + Send>>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.queue.id)
            .field("closed", &self.queue.is_closed())
            .finish_non_exhaustive()
    }
}

impl Subscription {
    /// The subscription's identifier on its bus.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.queue.id
    }

    /// Receive the next matching envelope. `None` after close.
    pub async fn recv(&mut self) -> Option<EventEnvelope> {
        self.queue.recv().await
    }

    /// Number of envelopes currently buffered.
    #[must_use]
    pub fn buffered(&self) -> usize {
        self.queue.len()
    }

    /// Close the subscription and deregister it from the bus. Idempotent.
    pub fn close(&mut self) {
        self.queue.close();
        if let Some(on_close) = self.on_close.take() {
            on_close(self.queue.id);
        }
    }

    /// Adapt into a [`futures::Stream`] of envelopes. The stream ends
    /// when the subscription closes.
    //
    // The `tail_expr_drop_order` warning originates inside the `stream!`
    // macro expansion under Rust 2024 and is a known upstream issue in
    // `async-stream`.
    #[allow(tail_expr_drop_order)]
    pub fn into_stream(mut self) -> impl futures::Stream<Item = EventEnvelope> + Send {
        async_stream::stream! {
            while let Some(envelope) = self.recv().await {
                yield envelope;
            }
        }
    }

    /// Adapt into a lazy [`Reader`] of envelopes. The reader is
    /// auto-close: dropping it tears the subscription down.
    #[must_use]
    pub fn into_reader(mut self) -> Reader<EventEnvelope> {
        let (writer, reader) = stream::pipe(64);
        let handle = tokio::spawn(async move {
            while let Some(envelope) = self.recv().await {
                if writer.send(envelope).await.is_err() {
                    break;
                }
            }
            self.close();
        });
        reader.with_producer(handle).auto_close()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.close();
    }
}
