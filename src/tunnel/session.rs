//! Authenticated controller session handle.
//!
//! A [`ControllerSession`] only exists for a socket whose handshake was
//! accepted; the connection handler creates it right after validation and
//! shares it with the registry. The socket itself stays with the handler's
//! loop, which drains [`SessionChannels`].

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Capacity of the per-session outbound queue.
const OUTBOUND_CAPACITY: usize = 16;

/// Why the relay closed a session on its own initiative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// A newer controller connection took the registry slot.
    Evicted,
    /// The relay is shutting down.
    Shutdown,
}

/// The outbound queue for the session is gone (its connection loop exited).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("controller session closed")]
pub struct SessionClosed;

/// Shared handle to one authenticated controller connection.
#[derive(Debug)]
pub struct ControllerSession {
    pub id: u64,
    pub device_id: String,
    pub connected_since: Instant,
    outbound: mpsc::Sender<String>,
    close_tx: watch::Sender<Option<CloseReason>>,
    /// Last pong as ms since `connected_since`.
    last_pong_ms: AtomicU64,
    probe_outstanding: AtomicBool,
}

/// Receiving ends owned by the connection loop.
pub struct SessionChannels {
    pub outbound_rx: mpsc::Receiver<String>,
    pub close_rx: watch::Receiver<Option<CloseReason>>,
}

impl ControllerSession {
    pub fn new(id: u64, device_id: impl Into<String>) -> (Self, SessionChannels) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let (close_tx, close_rx) = watch::channel(None);
        let session = Self {
            id,
            device_id: device_id.into(),
            connected_since: Instant::now(),
            outbound,
            close_tx,
            last_pong_ms: AtomicU64::new(0),
            probe_outstanding: AtomicBool::new(false),
        };
        (
            session,
            SessionChannels {
                outbound_rx,
                close_rx,
            },
        )
    }

    /// Queue a text frame for the controller.
    pub async fn send(&self, text: String) -> Result<(), SessionClosed> {
        self.outbound.send(text).await.map_err(|_| SessionClosed)
    }

    /// Ask the connection loop to close the socket gracefully.
    pub fn close(&self, reason: CloseReason) {
        self.close_tx.send_replace(Some(reason));
    }

    #[cfg(test)]
    pub fn close_requested(&self) -> Option<CloseReason> {
        *self.close_tx.borrow()
    }

    pub fn record_pong(&self, at: Instant) {
        #[allow(clippy::cast_possible_truncation)]
        let ms = at.saturating_duration_since(self.connected_since).as_millis() as u64;
        self.last_pong_ms.store(ms, Ordering::Relaxed);
        self.probe_outstanding.store(false, Ordering::Relaxed);
    }

    pub fn mark_probe_sent(&self) {
        self.probe_outstanding.store(true, Ordering::Relaxed);
    }

    pub fn probe_outstanding(&self) -> bool {
        self.probe_outstanding.load(Ordering::Relaxed)
    }

    /// Time since the last pong (or since connecting, before the first one).
    pub fn last_pong_age(&self) -> Duration {
        let last = self.connected_since
            + Duration::from_millis(self.last_pong_ms.load(Ordering::Relaxed));
        Instant::now().saturating_duration_since(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_reaches_loop_side() {
        let (session, mut ch) = ControllerSession::new(1, "dev1");
        session.send("hello".into()).await.unwrap();
        assert_eq!(ch.outbound_rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn send_fails_once_loop_is_gone() {
        let (session, ch) = ControllerSession::new(1, "dev1");
        drop(ch);
        assert_eq!(session.send("x".into()).await, Err(SessionClosed));
    }

    #[tokio::test]
    async fn close_signal_is_observed() {
        let (session, mut ch) = ControllerSession::new(1, "dev1");
        assert_eq!(session.close_requested(), None);
        session.close(CloseReason::Evicted);
        ch.close_rx.changed().await.unwrap();
        assert_eq!(*ch.close_rx.borrow(), Some(CloseReason::Evicted));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_bookkeeping() {
        let (session, _ch) = ControllerSession::new(1, "dev1");
        session.mark_probe_sent();
        assert!(session.probe_outstanding());

        tokio::time::advance(Duration::from_secs(3)).await;
        session.record_pong(Instant::now());
        assert!(!session.probe_outstanding());
        assert_eq!(session.last_pong_age(), Duration::ZERO);

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(session.last_pong_age(), Duration::from_secs(2));
    }
}
