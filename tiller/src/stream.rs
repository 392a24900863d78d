//! Typed lazy sequences.
//!
//! These are the channel primitives used for LLM chunk streams, tool
//! progress streams, and agent event streams:
//!
//! - [`pipe`] - a bounded writer/reader pair
//! - [`from_iter`] - a reader over fixed items
//! - [`merge`] / [`merge_named`] - fan-in, with named-EOF carriers
//! - [`Reader::transform`] / [`Reader::map`] / [`Reader::filter`] /
//!   [`Reader::take`] / [`Reader::for_each`] - lazy combinators
//! - [`copy`] - n independent consumers over one producer
//!
//! Readers are read-once; [`copy`] is the only way to obtain independent
//! consumers. Items carry per-item errors without terminating the stream;
//! a stream-fatal error is delivered as a final item followed by
//! end-of-stream.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::Stream;
use tokio::sync::{Mutex, OnceCell, mpsc};
use tokio::task::JoinHandle;

/// A non-fatal or fatal error travelling inside a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamError {
    /// Human-readable description.
    pub message: String,
    /// Whether the stream ends after this item.
    pub fatal: bool,
}

impl StreamError {
    /// Create a per-item (non-fatal) error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: false,
        }
    }

    /// Create a stream-fatal error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            fatal: true,
        }
    }
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.fatal {
            write!(f, "fatal stream error: {}", self.message)
        } else {
            write!(f, "stream error: {}", self.message)
        }
    }
}

impl std::error::Error for StreamError {}

/// One element of a stream: a value or a per-item error.
pub type Item<T> = Result<T, StreamError>;

/// Error returned when writing into a closed pipe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeClosed;

impl fmt::Display for PipeClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("pipe closed")
    }
}

impl std::error::Error for PipeClosed {}

/// Carrier used by [`merge_named`]: a value from a named source, or a
/// named end-of-stream marker emitted when that source closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Named<T> {
    /// A value produced by the source `name`.
    Item {
        /// Source name.
        name: String,
        /// The value.
        value: T,
    },
    /// The source `name` reached end-of-stream.
    Eof {
        /// Source name.
        name: String,
    },
}

// ---------------------------------------------------------------------------
// Writer
// ---------------------------------------------------------------------------

/// Producing half of a [`pipe`].
#[derive(Debug)]
pub struct Writer<T> {
    tx: Option<mpsc::Sender<Item<T>>>,
}

impl<T> Writer<T> {
    /// Send a value, awaiting capacity (backpressure).
    ///
    /// # Errors
    ///
    /// Returns [`PipeClosed`] when the reader has been closed or dropped.
    pub async fn send(&self, value: T) -> Result<(), PipeClosed> {
        match &self.tx {
            Some(tx) => tx.send(Ok(value)).await.map_err(|_| PipeClosed),
            None => Err(PipeClosed),
        }
    }

    /// Send a per-item error without terminating the stream.
    ///
    /// # Errors
    ///
    /// Returns [`PipeClosed`] when the reader has been closed or dropped.
    pub async fn send_error(&self, error: StreamError) -> Result<(), PipeClosed> {
        match &self.tx {
            Some(tx) => tx.send(Err(error)).await.map_err(|_| PipeClosed),
            None => Err(PipeClosed),
        }
    }

    /// Deliver a stream-fatal error as the final item and close.
    pub async fn fail(&mut self, message: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(Err(StreamError::fatal(message))).await;
        }
        self.close();
    }

    /// Signal end-of-stream to the reader. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    /// Returns `true` if the reader side is gone or the writer was closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.as_ref().is_none_or(mpsc::Sender::is_closed)
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

struct CopyShared<T> {
    source: Mutex<Option<Reader<T>>>,
    open_copies: AtomicUsize,
}

type CopyLink<T> = Option<(Item<T>, Arc<CopyNode<T>>)>;

/// One link of the lazily-extended chain behind [`copy`]. The first copy
/// to reach the tip pulls the source and fills the slot; later copies
/// read the cached item. Links behind the slowest consumer are freed as
/// its references drop.
struct CopyNode<T> {
    slot: OnceCell<CopyLink<T>>,
}

impl<T> CopyNode<T> {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            slot: OnceCell::new(),
        })
    }
}

enum ReaderKind<T> {
    Channel {
        rx: mpsc::Receiver<Item<T>>,
        producers: Vec<JoinHandle<()>>,
    },
    Shared {
        cursor: Arc<CopyNode<T>>,
        shared: Arc<CopyShared<T>>,
        done: bool,
    },
}

/// Consuming half of a lazy sequence.
///
/// Read-once: obtain independent consumers only through [`copy`].
pub struct Reader<T> {
    kind: ReaderKind<T>,
    auto_close: bool,
    closed: bool,
}

impl<T> fmt::Debug for Reader<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reader")
            .field("auto_close", &self.auto_close)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<T: Clone + Send + Sync + 'static> Reader<T> {
    fn from_channel(rx: mpsc::Receiver<Item<T>>, producers: Vec<JoinHandle<()>>) -> Self {
        Self {
            kind: ReaderKind::Channel { rx, producers },
            auto_close: false,
            closed: false,
        }
    }

    /// Pull the next item. `None` signals end-of-stream.
    pub async fn next(&mut self) -> Option<Item<T>> {
        if self.closed {
            return None;
        }
        match &mut self.kind {
            ReaderKind::Channel { rx, .. } => rx.recv().await,
            ReaderKind::Shared {
                cursor,
                shared,
                done,
            } => {
                if *done {
                    return None;
                }
                let resolved = {
                    let link = cursor
                        .slot
                        .get_or_init(|| {
                            Box::pin(async {
                                let mut guard = shared.source.lock().await;
                                match guard.as_mut() {
                                    Some(source) => match source.next().await {
                                        Some(item) => Some((item, CopyNode::new())),
                                        None => {
                                            // Source exhausted: release it eagerly.
                                            *guard = None;
                                            None
                                        }
                                    },
                                    None => None,
                                }
                            })
                        })
                        .await;
                    link.as_ref()
                        .map(|(item, next)| (item.clone(), Arc::clone(next)))
                };
                match resolved {
                    Some((item, next)) => {
                        *cursor = next;
                        Some(item)
                    }
                    None => {
                        *done = true;
                        None
                    }
                }
            }
        }
    }

    /// Bind background producer tasks to this reader so that closing (or
    /// dropping, when [`Reader::auto_close`] is set) releases them.
    #[must_use]
    pub fn with_producer(mut self, handle: JoinHandle<()>) -> Self {
        if let ReaderKind::Channel { producers, .. } = &mut self.kind {
            producers.push(handle);
        }
        self
    }

    /// Mark the reader auto-close: dropping it aborts bound producer
    /// tasks instead of leaking them.
    #[must_use]
    pub fn auto_close(mut self) -> Self {
        self.auto_close = true;
        self
    }

    /// Apply `f` to each value; [`Transformed::Skip`] drops the value
    /// without ending the stream. Per-item errors pass through.
    #[must_use]
    pub fn transform<U, F>(mut self, mut f: F) -> Reader<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> Transformed<U> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            while let Some(item) = self.next().await {
                let out = match item {
                    Ok(value) => match f(value) {
                        Transformed::Emit(mapped) => Ok(mapped),
                        Transformed::Skip => continue,
                    },
                    Err(e) => Err(e),
                };
                if tx.send(out).await.is_err() {
                    break;
                }
            }
        });
        Reader::from_channel(rx, vec![handle]).auto_close()
    }

    /// Map each value through `f`.
    #[must_use]
    pub fn map<U, F>(self, mut f: F) -> Reader<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnMut(T) -> U + Send + 'static,
    {
        self.transform(move |value| Transformed::Emit(f(value)))
    }

    /// Keep only values matching `predicate`.
    #[must_use]
    pub fn filter<F>(self, mut predicate: F) -> Self
    where
        F: FnMut(&T) -> bool + Send + 'static,
    {
        self.transform(move |value| {
            if predicate(&value) {
                Transformed::Emit(value)
            } else {
                Transformed::Skip
            }
        })
    }

    /// Take at most `n` items, then end the stream and close the source.
    #[must_use]
    pub fn take(mut self, n: usize) -> Self {
        let (tx, rx) = mpsc::channel(16);
        let handle = tokio::spawn(async move {
            let mut remaining = n;
            while remaining > 0 {
                let Some(item) = self.next().await else {
                    break;
                };
                if tx.send(item).await.is_err() {
                    break;
                }
                remaining -= 1;
            }
            self.close();
        });
        Reader::from_channel(rx, vec![handle]).auto_close()
    }

    /// Consume the stream, applying `f` to every item.
    pub async fn for_each<F>(mut self, mut f: F)
    where
        F: FnMut(Item<T>),
    {
        while let Some(item) = self.next().await {
            f(item);
        }
    }

    /// Drain the stream, collecting successful values and discarding
    /// per-item errors.
    pub async fn collect_values(mut self) -> Vec<T> {
        let mut values = Vec::new();
        while let Some(item) = self.next().await {
            if let Ok(value) = item {
                values.push(value);
            }
        }
        values
    }

    /// Adapt into a [`futures::Stream`] of items.
    pub fn into_stream(self) -> impl Stream<Item = Item<T>> + Send {
        futures::stream::unfold(self, |mut reader| async move {
            reader.next().await.map(|item| (item, reader))
        })
    }
}

impl<T> Reader<T> {
    /// Close the reader. Idempotent. Closing the last copy of a shared
    /// source closes the source itself.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match &mut self.kind {
            ReaderKind::Channel { rx, producers } => {
                rx.close();
                if self.auto_close {
                    for handle in producers.drain(..) {
                        handle.abort();
                    }
                }
            }
            ReaderKind::Shared { shared, done, .. } => {
                *done = true;
                if shared.open_copies.fetch_sub(1, Ordering::SeqCst) == 1 {
                    // Last copy gone. No copy can be pulling concurrently,
                    // so the lock is free except for benign races.
                    if let Ok(mut guard) = shared.source.try_lock() {
                        if let Some(source) = guard.as_mut() {
                            source.close();
                        }
                        *guard = None;
                    }
                }
            }
        }
    }
}

impl<T> Drop for Reader<T> {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        match &mut self.kind {
            ReaderKind::Channel { producers, .. } => {
                if self.auto_close {
                    for handle in producers.drain(..) {
                        handle.abort();
                    }
                }
            }
            ReaderKind::Shared { shared, .. } => {
                if shared.open_copies.fetch_sub(1, Ordering::SeqCst) == 1 {
                    if let Ok(mut guard) = shared.source.try_lock() {
                        if let Some(source) = guard.as_mut() {
                            source.close();
                        }
                        *guard = None;
                    }
                }
            }
        }
    }
}

/// Result of a [`Reader::transform`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transformed<U> {
    /// Emit the mapped value.
    Emit(U),
    /// Drop the value; the stream continues.
    Skip,
}

// ---------------------------------------------------------------------------
// Constructors
// ---------------------------------------------------------------------------

/// Create a bounded writer/reader pair. `capacity` is clamped to at
/// least one slot.
#[must_use]
pub fn pipe<T: Clone + Send + Sync + 'static>(capacity: usize) -> (Writer<T>, Reader<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (Writer { tx: Some(tx) }, Reader::from_channel(rx, Vec::new()))
}

/// A reader over a fixed set of items. Ends after the last one.
#[must_use]
pub fn from_iter<T, I>(items: I) -> Reader<T>
where
    T: Clone + Send + Sync + 'static,
    I: IntoIterator<Item = T>,
{
    let items: Vec<T> = items.into_iter().collect();
    let (tx, rx) = mpsc::channel(items.len().max(1));
    for item in items {
        // Capacity equals the item count, so try_send cannot fail.
        let _ = tx.try_send(Ok(item));
    }
    drop(tx);
    Reader::from_channel(rx, Vec::new())
}

/// Merge several readers into one. Interleaving is arbitrary; the merged
/// stream ends when every source has ended.
#[must_use]
pub fn merge<T: Clone + Send + Sync + 'static>(readers: Vec<Reader<T>>) -> Reader<T> {
    let (tx, rx) = mpsc::channel(16);
    let mut producers = Vec::with_capacity(readers.len());
    for mut reader in readers {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        }));
    }
    drop(tx);
    Reader::from_channel(rx, producers).auto_close()
}

/// Merge named readers. Each source's close emits a [`Named::Eof`]
/// carrier before the merged stream moves on.
#[must_use]
pub fn merge_named<T: Clone + Send + Sync + 'static>(
    readers: HashMap<String, Reader<T>>,
) -> Reader<Named<T>> {
    let (tx, rx) = mpsc::channel(16);
    let mut producers = Vec::with_capacity(readers.len());
    for (name, mut reader) in readers {
        let tx = tx.clone();
        producers.push(tokio::spawn(async move {
            while let Some(item) = reader.next().await {
                let out = item.map(|value| Named::Item {
                    name: name.clone(),
                    value,
                });
                if tx.send(out).await.is_err() {
                    return;
                }
            }
            let _ = tx.send(Ok(Named::Eof { name })).await;
        }));
    }
    drop(tx);
    Reader::from_channel(rx, producers).auto_close()
}

/// Split a reader into `n` independent consumers.
///
/// Each copy consumes at its own pace: the first copy to reach the tip of
/// the shared chain pulls the source and extends it lazily, and links are
/// released once the slowest consumer moves past them. Closing every copy
/// closes the source.
#[must_use]
pub fn copy<T: Clone + Send + 'static>(reader: Reader<T>, n: usize) -> Vec<Reader<T>> {
    let shared = Arc::new(CopyShared {
        source: Mutex::new(Some(reader)),
        open_copies: AtomicUsize::new(n),
    });
    let head = CopyNode::new();
    (0..n)
        .map(|_| Reader {
            kind: ReaderKind::Shared {
                cursor: Arc::clone(&head),
                shared: Arc::clone(&shared),
                done: false,
            },
            auto_close: false,
            closed: false,
        })
        .collect()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    mod pipe_basics {
        use super::*;

        #[tokio::test]
        async fn send_then_receive() {
            let (writer, mut reader) = pipe::<i32>(4);
            writer.send(1).await.unwrap();
            writer.send(2).await.unwrap();
            assert_eq!(reader.next().await.unwrap().unwrap(), 1);
            assert_eq!(reader.next().await.unwrap().unwrap(), 2);
        }

        #[tokio::test]
        async fn writer_close_signals_eof() {
            let (mut writer, mut reader) = pipe::<i32>(4);
            writer.send(1).await.unwrap();
            writer.close();
            assert_eq!(reader.next().await.unwrap().unwrap(), 1);
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn writer_close_is_idempotent() {
            let (mut writer, _reader) = pipe::<i32>(1);
            writer.close();
            writer.close();
            assert!(writer.is_closed());
        }

        #[tokio::test]
        async fn reader_close_rejects_sends() {
            let (writer, mut reader) = pipe::<i32>(1);
            reader.close();
            reader.close();
            assert_eq!(writer.send(1).await, Err(PipeClosed));
        }

        #[tokio::test]
        async fn per_item_error_does_not_terminate() {
            let (mut writer, mut reader) = pipe::<i32>(4);
            writer.send(1).await.unwrap();
            writer.send_error(StreamError::new("hiccup")).await.unwrap();
            writer.send(2).await.unwrap();
            writer.close();

            assert_eq!(reader.next().await.unwrap().unwrap(), 1);
            let err = reader.next().await.unwrap().unwrap_err();
            assert!(!err.fatal);
            assert_eq!(reader.next().await.unwrap().unwrap(), 2);
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn fail_delivers_fatal_error_then_eof() {
            let (mut writer, mut reader) = pipe::<i32>(4);
            writer.send(1).await.unwrap();
            writer.fail("provider exploded").await;

            assert_eq!(reader.next().await.unwrap().unwrap(), 1);
            let err = reader.next().await.unwrap().unwrap_err();
            assert!(err.fatal);
            assert_eq!(err.message, "provider exploded");
            assert!(reader.next().await.is_none());
        }
    }

    mod constructors {
        use super::*;

        #[tokio::test]
        async fn from_iter_yields_all_then_eof() {
            let mut reader = from_iter(vec![1, 2, 3]);
            assert_eq!(reader.next().await.unwrap().unwrap(), 1);
            assert_eq!(reader.next().await.unwrap().unwrap(), 2);
            assert_eq!(reader.next().await.unwrap().unwrap(), 3);
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn from_iter_empty() {
            let mut reader = from_iter(Vec::<i32>::new());
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn merge_combines_all_sources() {
            let merged = merge(vec![from_iter(vec![1, 2]), from_iter(vec![3, 4, 5])]);
            let mut values = merged.collect_values().await;
            values.sort_unstable();
            assert_eq!(values, vec![1, 2, 3, 4, 5]);
        }

        #[tokio::test]
        async fn merge_named_emits_eof_carriers() {
            let mut readers = HashMap::new();
            readers.insert("a".to_string(), from_iter(vec![1]));
            readers.insert("b".to_string(), from_iter(Vec::<i32>::new()));
            let merged = merge_named(readers);

            let items = merged.collect_values().await;
            let eofs: Vec<&str> = items
                .iter()
                .filter_map(|item| match item {
                    Named::Eof { name } => Some(name.as_str()),
                    Named::Item { .. } => None,
                })
                .collect();
            assert_eq!(eofs.len(), 2, "one EOF carrier per source: {items:?}");
            assert!(eofs.contains(&"a") && eofs.contains(&"b"));
            assert!(items.iter().any(|item| matches!(
                item,
                Named::Item { name, value: 1 } if name == "a"
            )));
        }
    }

    mod combinators {
        use super::*;

        #[tokio::test]
        async fn transform_can_skip() {
            let reader = from_iter(vec![1, 2, 3, 4]).transform(|v| {
                if v % 2 == 0 {
                    Transformed::Emit(v * 10)
                } else {
                    Transformed::Skip
                }
            });
            assert_eq!(reader.collect_values().await, vec![20, 40]);
        }

        #[tokio::test]
        async fn map_and_filter() {
            let reader = from_iter(vec![1, 2, 3]).map(|v| v + 1).filter(|v| *v > 2);
            assert_eq!(reader.collect_values().await, vec![3, 4]);
        }

        #[tokio::test]
        async fn take_limits_and_closes() {
            let reader = from_iter(vec![1, 2, 3, 4, 5]).take(2);
            assert_eq!(reader.collect_values().await, vec![1, 2]);
        }

        #[tokio::test]
        async fn transform_passes_errors_through() {
            let (mut writer, reader) = pipe::<i32>(4);
            writer.send(1).await.unwrap();
            writer.send_error(StreamError::new("oops")).await.unwrap();
            writer.close();

            let mut reader = reader.map(|v| v * 2);
            assert_eq!(reader.next().await.unwrap().unwrap(), 2);
            assert!(reader.next().await.unwrap().is_err());
            assert!(reader.next().await.is_none());
        }

        #[tokio::test]
        async fn for_each_visits_every_item() {
            let mut seen = Vec::new();
            from_iter(vec![1, 2, 3])
                .for_each(|item| {
                    if let Ok(v) = item {
                        seen.push(v);
                    }
                })
                .await;
            assert_eq!(seen, vec![1, 2, 3]);
        }
    }

    mod copies {
        use super::*;

        #[tokio::test]
        async fn copies_see_identical_sequences() {
            let source = from_iter(vec![1, 2, 3]);
            let mut copies = copy(source, 2);
            let mut r2 = copies.pop().unwrap();
            let mut r1 = copies.pop().unwrap();

            // Interleaved consumption.
            assert_eq!(r1.next().await.unwrap().unwrap(), 1);
            assert_eq!(r2.next().await.unwrap().unwrap(), 1);
            assert_eq!(r2.next().await.unwrap().unwrap(), 2);
            assert_eq!(r1.next().await.unwrap().unwrap(), 2);
            assert_eq!(r1.next().await.unwrap().unwrap(), 3);
            assert!(r1.next().await.is_none());
            assert_eq!(r2.next().await.unwrap().unwrap(), 3);
            assert!(r2.next().await.is_none());
        }

        #[tokio::test]
        async fn fast_copy_drains_without_slow_copy() {
            let source = from_iter((0..100).collect::<Vec<i32>>());
            let mut copies = copy(source, 2);
            let _slow = copies.pop().unwrap();
            let fast = copies.pop().unwrap();

            // The untouched slow copy must not block the fast one.
            let values = fast.collect_values().await;
            assert_eq!(values.len(), 100);
        }

        #[tokio::test]
        async fn closing_all_copies_closes_source() {
            let (writer, reader) = pipe::<i32>(1);
            let copies = copy(reader, 2);
            for mut c in copies {
                c.close();
            }
            // Give the channel a moment to observe closure.
            assert_eq!(writer.send(1).await, Err(PipeClosed));
        }

        #[tokio::test]
        async fn copy_of_live_pipe() {
            let (mut writer, reader) = pipe::<i32>(4);
            let mut copies = copy(reader, 3);

            writer.send(7).await.unwrap();
            writer.close();

            for c in &mut copies {
                assert_eq!(c.next().await.unwrap().unwrap(), 7);
                assert!(c.next().await.is_none());
            }
        }
    }

    mod interop {
        use super::*;
        use futures::StreamExt as _;

        #[tokio::test]
        async fn into_stream_yields_items() {
            let stream = from_iter(vec![1, 2]).into_stream();
            let items: Vec<_> = stream.collect().await;
            assert_eq!(items.len(), 2);
        }
    }
}
