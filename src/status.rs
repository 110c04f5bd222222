//! Connectivity status fan-out.
//!
//! The tunnel registry publishes every "controller attached" transition here;
//! each observer (one per SSE client) first receives the latest known value,
//! then every published transition. [`StatusBroadcaster::close`] ends every
//! observer so long-lived streams finish on shutdown.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, watch};

const CHANNEL_CAPACITY: usize = 64;

/// Publisher side of the connectivity feed.
#[derive(Clone)]
pub struct StatusBroadcaster {
    tx: broadcast::Sender<bool>,
    latest: Arc<AtomicBool>,
    observers: Arc<AtomicU32>,
    closed: Arc<watch::Sender<bool>>,
}

impl Default for StatusBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            latest: Arc::new(AtomicBool::new(false)),
            observers: Arc::new(AtomicU32::new(0)),
            closed: Arc::new(watch::channel(false).0),
        }
    }

    /// Record `connected` as the latest value and deliver it to every observer.
    pub fn publish(&self, connected: bool) {
        self.latest.store(connected, Ordering::SeqCst);
        // No receivers is fine: the value is kept in `latest` for new observers.
        let _ = self.tx.send(connected);
    }

    pub fn latest(&self) -> bool {
        self.latest.load(Ordering::SeqCst)
    }

    /// Register an observer without a cap. Its first
    /// [`StatusObserver::next`] yields the latest value.
    pub fn observe(&self) -> StatusObserver {
        self.observers.fetch_add(1, Ordering::Relaxed);
        self.registered_observer()
    }

    /// Register an observer while fewer than `max` are registered. The slot
    /// is reserved atomically. Its first [`StatusObserver::next`] yields the
    /// latest value.
    pub fn try_observe(&self, max: u32) -> Option<StatusObserver> {
        self.observers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()?;
        Some(self.registered_observer())
    }

    /// Build an observer whose count slot is already taken.
    fn registered_observer(&self) -> StatusObserver {
        // Subscribe before reading `latest` so a concurrent publish is seen
        // at worst twice, never missed.
        let rx = self.tx.subscribe();
        StatusObserver {
            rx,
            initial: Some(self.latest()),
            latest: self.latest.clone(),
            observers: self.observers.clone(),
            closed: self.closed.subscribe(),
            registered: true,
        }
    }

    /// End every current and future observer.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }

    /// Number of currently registered observers.
    pub fn observer_count(&self) -> u32 {
        self.observers.load(Ordering::Relaxed)
    }
}

/// A registered connectivity observer.
pub struct StatusObserver {
    rx: broadcast::Receiver<bool>,
    initial: Option<bool>,
    latest: Arc<AtomicBool>,
    observers: Arc<AtomicU32>,
    closed: watch::Receiver<bool>,
    registered: bool,
}

impl StatusObserver {
    /// Next connectivity value, or `None` once unregistered or the
    /// broadcaster is gone.
    pub async fn next(&mut self) -> Option<bool> {
        if *self.closed.borrow() {
            self.unregister();
        }
        if !self.registered {
            return None;
        }
        if let Some(v) = self.initial.take() {
            return Some(v);
        }
        let received = tokio::select! {
            r = self.rx.recv() => Some(r),
            () = wait_closed(&mut self.closed) => None,
        };
        match received {
            Some(Ok(v)) => Some(v),
            // Skipped transitions collapse into the current value.
            Some(Err(broadcast::error::RecvError::Lagged(_))) => {
                Some(self.latest.load(Ordering::SeqCst))
            }
            Some(Err(broadcast::error::RecvError::Closed)) | None => {
                self.unregister();
                None
            }
        }
    }

    /// Stop observing. Safe to call any number of times.
    pub fn unregister(&mut self) {
        if self.registered {
            self.registered = false;
            self.observers.fetch_sub(1, Ordering::Relaxed);
        }
    }
}

async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    // An error means the broadcaster is gone, which also ends the observer.
    let _ = closed.wait_for(|c| *c).await;
}

impl Drop for StatusObserver {
    fn drop(&mut self) {
        self.unregister();
    }
}
