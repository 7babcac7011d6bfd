//! External invalidation trigger.
//!
//! A payload-free signal meaning "the environment changed, the current
//! encoder session can no longer be trusted", e.g. the device reclaimed
//! hardware codec resources while the application was suspended. The
//! source side is clonable and can live anywhere; the controller holds
//! one [`TriggerListener`] from construction until teardown.

use tokio::sync::broadcast;

/// Pending signals kept per listener before it reports a lag.
const TRIGGER_CAPACITY: usize = 16;

/// Source of invalidation signals.
#[derive(Debug, Clone)]
pub struct InvalidationTrigger {
    tx: broadcast::Sender<()>,
}

impl InvalidationTrigger {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(TRIGGER_CAPACITY);
        Self { tx }
    }

    /// Fire the signal. Returns how many listeners will observe it.
    pub fn fire(&self) -> usize {
        let listeners = self.tx.send(()).unwrap_or(0);
        tracing::debug!(listeners, "Invalidation trigger fired");
        listeners
    }

    /// Register a new listener. It observes only signals fired after this call.
    #[must_use]
    pub fn listen(&self) -> TriggerListener {
        TriggerListener {
            rx: Some(self.tx.subscribe()),
        }
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for InvalidationTrigger {
    fn default() -> Self {
        Self::new()
    }
}

/// Receiving end of an [`InvalidationTrigger`].
#[derive(Debug)]
pub struct TriggerListener {
    rx: Option<broadcast::Receiver<()>>,
}

impl TriggerListener {
    /// A listener that never fires.
    #[must_use]
    pub fn detached() -> Self {
        Self { rx: None }
    }

    /// Wait for the next signal.
    ///
    /// Any number of signals missed while lagging count as one. Once every
    /// source is gone this never resolves.
    pub async fn fired(&mut self) {
        loop {
            let Some(rx) = self.rx.as_mut() else {
                return std::future::pending().await;
            };
            match rx.recv().await {
                Ok(()) => return,
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::debug!(missed, "Invalidation trigger lagged, coalescing");
                    return;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    tracing::debug!("Invalidation trigger source closed");
                    self.rx = None;
                }
            }
        }
    }

    /// Whether this listener can still observe signals.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.rx.is_some()
    }
}
