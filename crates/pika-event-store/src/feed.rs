//! Ordered change feed with independent subscriber taps.
//!
//! Publishers push into one bounded source channel. A dedicated fan-out thread
//! drains it and copies every item into each subscriber's own unbounded tap, so:
//!
//! - publishers wait only when the fan-out is `capacity` items behind;
//! - a slow subscriber grows its own tap and never stalls publishers or peers;
//! - dropping a tap is non-blocking; it is pruned on the next delivery.
//!
//! A tap sees every item the fan-out delivers after the tap was registered, in
//! publish order.

use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use flume::{Receiver, Sender};

/// Source buffer large enough to absorb a full relay backlog.
pub const DEFAULT_FEED_CAPACITY: usize = 10_000;

type Taps<T> = Arc<Mutex<Vec<Sender<T>>>>;

pub struct Feed<T> {
    source: Sender<T>,
    taps: Taps<T>,
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new(name: &str, capacity: usize) -> Self {
        let (source, rx) = flume::bounded::<T>(capacity.max(1));
        let taps: Taps<T> = Arc::new(Mutex::new(Vec::new()));
        let taps_for_fanout = taps.clone();
        let spawned = thread::Builder::new()
            .name(format!("pika-feed-{name}"))
            .spawn(move || fan_out(rx, taps_for_fanout));
        if let Err(e) = spawned {
            // Publishing still works; items just pile up in the source buffer.
            tracing::error!(%e, feed = name, "failed to spawn feed fan-out thread");
        }
        Self { source, taps }
    }

    /// Publish one item, waiting while the source buffer is full.
    pub async fn publish(&self, item: T) {
        if self.source.send_async(item).await.is_err() {
            tracing::error!("impossible state: feed fan-out is gone");
        }
    }

    /// Blocking variant of [`Feed::publish`] for non-async callers.
    pub fn publish_blocking(&self, item: T) {
        if self.source.send(item).is_err() {
            tracing::error!("impossible state: feed fan-out is gone");
        }
    }

    pub fn subscribe(&self) -> Tap<T> {
        let (tx, rx) = flume::unbounded();
        lock(&self.taps).push(tx);
        Tap { rx }
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.taps).len()
    }
}

fn lock<T>(taps: &Mutex<Vec<Sender<T>>>) -> MutexGuard<'_, Vec<Sender<T>>> {
    match taps.lock() {
        Ok(g) => g,
        Err(poison) => poison.into_inner(),
    }
}

fn fan_out<T: Clone>(rx: Receiver<T>, taps: Taps<T>) {
    while let Ok(item) = rx.recv() {
        lock(&taps).retain(|tap| tap.send(item.clone()).is_ok());
    }
}

/// One subscriber's view of a [`Feed`].
pub struct Tap<T> {
    rx: Receiver<T>,
}

impl<T> Tap<T> {
    /// Next item, or `None` once the feed is gone and the tap is drained.
    pub async fn recv(&self) -> Option<T> {
        self.rx.recv_async().await.ok()
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    pub fn into_stream(self) -> flume::r#async::RecvStream<'static, T>
    where
        T: 'static,
    {
        self.rx.into_stream()
    }

    /// Stop receiving. Equivalent to dropping the tap.
    pub fn close(self) {}
}
