//! Single-producer, multi-subscriber fan-out.
//!
//! One pump task moves items from the input channel into every registered
//! subscriber queue. Delivery blocks on each queue in turn, so a slow
//! subscriber holds back the whole bus instead of losing items.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Queue depth of each subscription.
pub const SUBSCRIPTION_CAPACITY: usize = 10;

struct Consumers<T> {
    next_id: u64,
    senders: BTreeMap<u64, mpsc::Sender<T>>,
    closed: bool,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Broadcaster<T> {
    consumers: Arc<Mutex<Consumers<T>>>,
    input: Mutex<Option<mpsc::Receiver<T>>>,
    draining: CancellationToken,
    closed: CancellationToken,
}

impl<T: Clone + Send + 'static> Broadcaster<T> {
    /// Fan out everything received on `input`.
    pub fn new(input: mpsc::Receiver<T>) -> Self {
        Self {
            consumers: Arc::new(Mutex::new(Consumers {
                next_id: 0,
                senders: BTreeMap::new(),
                closed: false,
            })),
            input: Mutex::new(Some(input)),
            draining: CancellationToken::new(),
            closed: CancellationToken::new(),
        }
    }

    /// Create a broadcaster along with the sender feeding it.
    pub fn channel(capacity: usize) -> (mpsc::Sender<T>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    /// Register a new subscriber. After the bus has closed the subscription
    /// is returned already closed.
    pub fn subscribe(&self) -> Subscription<T> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let mut consumers = lock(&self.consumers);
        let id = consumers.next_id;
        consumers.next_id += 1;
        if !consumers.closed {
            consumers.senders.insert(id, tx);
        }
        Subscription {
            id,
            rx,
            consumers: Arc::downgrade(&self.consumers),
        }
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.consumers).closed
    }

    /// Pump items until the input closes, the bus is closed, or `cancel`
    /// fires. Cancellation is a hard close.
    pub async fn start(&self, cancel: CancellationToken) {
        let input = lock(&self.input).take();
        let Some(mut input) = input else {
            tracing::warn!("broadcaster already started");
            return;
        };

        let mut draining = false;
        loop {
            let item = tokio::select! {
                biased;
                _ = self.closed.cancelled() => break,
                _ = cancel.cancelled() => {
                    self.close();
                    break;
                }
                _ = self.draining.cancelled(), if !draining => {
                    input.close();
                    draining = true;
                    continue;
                }
                item = input.recv() => match item {
                    Some(item) => item,
                    None => break,
                },
            };

            if !self.deliver(item, &cancel).await {
                break;
            }
        }

        self.finish();
    }

    /// Returns false when the bus was closed mid-delivery.
    async fn deliver(&self, item: T, cancel: &CancellationToken) -> bool {
        let senders: Vec<mpsc::Sender<T>> =
            lock(&self.consumers).senders.values().cloned().collect();
        for tx in senders {
            tokio::select! {
                biased;
                _ = self.closed.cancelled() => return false,
                _ = cancel.cancelled() => {
                    self.close();
                    return false;
                }
                // A subscriber closed concurrently is simply skipped.
                _ = tx.send(item.clone()) => {}
            }
        }
        true
    }

    fn finish(&self) {
        let mut consumers = lock(&self.consumers);
        consumers.closed = true;
        consumers.senders.clear();
    }

    /// Graceful close: stop accepting input but deliver everything already
    /// queued before the pump exits.
    pub fn shutdown(&self) {
        self.draining.cancel();
    }

    /// Immediate close: queued input is dropped and every subscription ends.
    pub fn close(&self) {
        self.finish();
        self.closed.cancel();
        if let Some(mut input) = lock(&self.input).take() {
            input.close();
        }
    }
}

/// A subscriber's queue. Dropping or closing it removes it from the bus.
pub struct Subscription<T> {
    id: u64,
    rx: mpsc::Receiver<T>,
    consumers: Weak<Mutex<Consumers<T>>>,
}

impl<T> Subscription<T> {
    /// Next item, or `None` once the bus has closed and the queue is empty.
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    pub fn close(&mut self) {
        if let Some(consumers) = self.consumers.upgrade() {
            lock(&consumers).senders.remove(&self.id);
        }
        self.rx.close();
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn drain(sub: &mut Subscription<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(item) = sub.recv().await {
            out.push(item);
        }
        out
    }

    #[tokio::test]
    async fn every_subscriber_sees_every_item_in_order() {
        let (tx, bus) = Broadcaster::channel(4);
        let bus = Arc::new(bus);
        let mut subs: Vec<_> = (0..3).map(|_| bus.subscribe()).collect();

        let pump = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start(CancellationToken::new()).await }
        });

        let readers: Vec<_> = subs
            .drain(..)
            .map(|mut sub| tokio::spawn(async move { drain(&mut sub).await }))
            .collect();

        for i in 0..50 {
            tx.send(i).await.unwrap();
        }
        drop(tx);
        pump.await.unwrap();

        let expected: Vec<u32> = (0..50).collect();
        for reader in readers {
            assert_eq!(reader.await.unwrap(), expected);
        }
    }

    #[tokio::test]
    async fn subscribe_after_close_is_already_closed() {
        let (_tx, bus) = Broadcaster::<u32>::channel(4);
        bus.close();
        assert!(bus.is_closed());

        let mut sub = bus.subscribe();
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn shutdown_drains_queued_items() {
        let (tx, bus) = Broadcaster::channel(8);
        let bus = Arc::new(bus);
        let mut sub = bus.subscribe();

        for i in 0..5 {
            tx.send(i).await.unwrap();
        }

        let pump = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start(CancellationToken::new()).await }
        });
        let reader = tokio::spawn(async move { drain(&mut sub).await });

        tokio::task::yield_now().await;
        bus.shutdown();
        pump.await.unwrap();

        assert_eq!(reader.await.unwrap(), vec![0, 1, 2, 3, 4]);
        // Input is closed for good.
        assert!(tx.send(99).await.is_err());

        let mut late = bus.subscribe();
        assert_eq!(late.recv().await, None);
    }

    #[tokio::test]
    async fn close_before_start_drops_input() {
        let (tx, bus) = Broadcaster::channel(8);
        let mut sub = bus.subscribe();
        tx.send(1).await.unwrap();

        bus.close();
        bus.start(CancellationToken::new()).await;

        assert_eq!(sub.recv().await, None);
        assert!(tx.send(2).await.is_err());
    }

    #[tokio::test]
    async fn closed_subscription_does_not_block_the_bus() {
        let (tx, bus) = Broadcaster::channel(4);
        let bus = Arc::new(bus);
        let mut idle = bus.subscribe();
        let mut active = bus.subscribe();

        let pump = tokio::spawn({
            let bus = bus.clone();
            async move { bus.start(CancellationToken::new()).await }
        });

        idle.close();
        for i in 0..(SUBSCRIPTION_CAPACITY as u32 * 3) {
            tx.send(i).await.unwrap();
            assert_eq!(active.recv().await, Some(i));
        }
        drop(tx);
        pump.await.unwrap();
        assert_eq!(idle.recv().await, None);
    }

    #[tokio::test]
    async fn cancellation_is_a_hard_close() {
        let (tx, bus) = Broadcaster::<u32>::channel(4);
        let bus = Arc::new(bus);
        let mut sub = bus.subscribe();
        let cancel = CancellationToken::new();

        let pump = tokio::spawn({
            let bus = bus.clone();
            let cancel = cancel.clone();
            async move { bus.start(cancel).await }
        });

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), pump)
            .await
            .unwrap()
            .unwrap();

        assert!(bus.is_closed());
        assert_eq!(sub.recv().await, None);
        drop(tx);
    }
}
