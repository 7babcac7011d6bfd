//! Broadcast output hub.
//!
//! Fans every encoder completion out to the current set of subscribers.
//! Each subscriber owns an unbounded channel, so a slow consumer only grows
//! its own buffer and never stalls the producer or its peers.
//!
//! ```text
//!   OutputSink ──► pump thread ──► hub.deliver()
//!                                    │ snapshot of senders
//!                    ┌───────────────┼───────────────┐
//!                    ▼               ▼               ▼
//!              [Subscription]  [Subscription]  [Subscription]
//!                 recv()          recv()          recv()
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, watch};
use transcode_media::EncoderOutput;

pub use tokio::sync::mpsc::error::TryRecvError;

/// Identity of one subscription within a hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Default)]
struct Subscribers {
    senders: HashMap<SubscriptionId, mpsc::UnboundedSender<EncoderOutput>>,
    closed: bool,
}

/// Registry of active subscriptions and the delivery routine.
///
/// The subscriber set has its own lock and may be changed from any thread,
/// including while a delivery pass is running. Delivery passes are
/// serialized so that every subscription observes outputs in `deliver`
/// order.
#[derive(Debug)]
pub struct BroadcastHub {
    subscribers: Mutex<Subscribers>,
    delivery: Mutex<()>,
    next_id: AtomicU64,
    closed_tx: watch::Sender<bool>,
}

/// Lock a hub mutex, logging a warning if it was poisoned.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| {
        tracing::warn!("Broadcast hub: mutex was poisoned, recovering");
        e.into_inner()
    })
}

impl BroadcastHub {
    /// Create an empty, open hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        let (closed_tx, _) = watch::channel(false);
        Arc::new(Self {
            subscribers: Mutex::new(Subscribers::default()),
            delivery: Mutex::new(()),
            next_id: AtomicU64::new(1),
            closed_tx,
        })
    }

    /// Start observing output.
    ///
    /// The subscription only sees outputs delivered after this call. On a
    /// closed hub the returned subscription is already finished.
    pub fn subscribe(self: &Arc<Self>) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut subscribers = lock(&self.subscribers);
        if subscribers.closed {
            tracing::debug!(subscription = %id, "Subscribed to closed hub");
        } else {
            subscribers.senders.insert(id, tx);
            tracing::debug!(
                subscription = %id,
                subscribers = subscribers.senders.len(),
                "Subscriber added"
            );
        }

        Subscription {
            id,
            rx,
            hub: Arc::downgrade(self),
        }
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    ///
    /// Safe to call at any time; a delivery pass already holding a
    /// snapshot may still hand the subscriber one more output.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = lock(&self.subscribers);
        let removed = subscribers.senders.remove(&id).is_some();
        if removed {
            tracing::debug!(
                subscription = %id,
                subscribers = subscribers.senders.len(),
                "Subscriber removed"
            );
        }
        removed
    }

    /// Number of active subscriptions.
    pub fn subscriber_count(&self) -> usize {
        lock(&self.subscribers).senders.len()
    }

    /// Send `output` to every current subscriber.
    ///
    /// Returns the number of subscribers that accepted it. Subscribers whose
    /// receiving side is gone are pruned.
    pub fn deliver(&self, output: EncoderOutput) -> usize {
        let _pass = lock(&self.delivery);

        let snapshot: Vec<_> = lock(&self.subscribers)
            .senders
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for (id, tx) in snapshot {
            if tx.send(output.clone()).is_ok() {
                delivered += 1;
            } else {
                gone.push(id);
            }
        }

        if !gone.is_empty() {
            let mut subscribers = lock(&self.subscribers);
            for id in &gone {
                subscribers.senders.remove(id);
            }
            tracing::debug!(
                pruned = gone.len(),
                subscribers = subscribers.senders.len(),
                "Pruned subscribers without readers"
            );
        }

        delivered
    }

    /// Finish every subscription and refuse new ones.
    ///
    /// Subscribers still receive what is already buffered, then see the
    /// end of the stream.
    pub fn close(&self) {
        let mut subscribers = lock(&self.subscribers);
        if subscribers.closed {
            return;
        }
        subscribers.closed = true;
        let finished = subscribers.senders.len();
        subscribers.senders.clear();
        drop(subscribers);

        self.closed_tx.send_replace(true);
        tracing::debug!(finished, "Broadcast hub closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }

    /// Wait until [`close`](BroadcastHub::close) has been called.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }
}

/// A consumer's view of the encoder output.
///
/// Yields outputs in delivery order until the consumer drops it, calls
/// [`BroadcastHub::unsubscribe`], or the hub closes. Dropping a
/// subscription unsubscribes it.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    rx: mpsc::UnboundedReceiver<EncoderOutput>,
    hub: Weak<BroadcastHub>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Wait for the next output. `None` means the stream has ended.
    pub async fn recv(&mut self) -> Option<EncoderOutput> {
        self.rx.recv().await
    }

    /// Take the next buffered output without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`TryRecvError::Empty`] when nothing is buffered and
    /// [`TryRecvError::Disconnected`] once the stream has ended.
    pub fn try_recv(&mut self) -> Result<EncoderOutput, TryRecvError> {
        self.rx.try_recv()
    }

    /// Blocking variant of [`recv`](Subscription::recv) for non-async
    /// consumers. Must not be called from within an async runtime.
    pub fn blocking_recv(&mut self) -> Option<EncoderOutput> {
        self.rx.blocking_recv()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(hub) = self.hub.upgrade() {
            hub.unsubscribe(self.id);
        }
    }
}
