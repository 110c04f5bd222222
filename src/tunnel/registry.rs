//! The single-slot controller registry.
//!
//! At most one authenticated controller session is "current". Attaching a new
//! session evicts the previous one (last writer wins); detaching is guarded by
//! session id so a late close from an evicted session never clears its
//! successor. Connectivity transitions are published to the
//! [`StatusBroadcaster`] while the slot lock is held, so published events
//! follow slot order.

use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::info;

use super::session::{CloseReason, ControllerSession};
use crate::status::{StatusBroadcaster, StatusObserver};

#[derive(Clone)]
pub struct TunnelRegistry {
    slot: Arc<RwLock<Option<Arc<ControllerSession>>>>,
    status: StatusBroadcaster,
}

impl TunnelRegistry {
    pub fn new(status: StatusBroadcaster) -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
            status,
        }
    }

    /// Install `session` as the current controller. Returns the evicted
    /// session, which has already been asked to close.
    pub async fn attach(&self, session: Arc<ControllerSession>) -> Option<Arc<ControllerSession>> {
        let mut slot = self.slot.write().await;
        let previous = slot.replace(session);
        match &previous {
            Some(old) => {
                info!(
                    session_id = old.id,
                    device_id = %old.device_id,
                    "Evicting previous controller session"
                );
                old.close(CloseReason::Evicted);
            }
            None => self.status.publish(true),
        }
        previous
    }

    /// Remove `session` if it is still the current one.
    pub async fn detach(&self, session: &ControllerSession) -> bool {
        let mut slot = self.slot.write().await;
        if slot.as_ref().is_some_and(|s| s.id == session.id) {
            *slot = None;
            self.status.publish(false);
            true
        } else {
            false
        }
    }

    /// Snapshot of the current controller session.
    pub async fn current(&self) -> Option<Arc<ControllerSession>> {
        self.slot.read().await.clone()
    }

    /// Clear the slot and close whatever session held it.
    pub async fn close_current(&self, reason: CloseReason) -> Option<Arc<ControllerSession>> {
        let mut slot = self.slot.write().await;
        let session = slot.take()?;
        session.close(reason);
        self.status.publish(false);
        Some(session)
    }

    /// Live feed of connectivity, starting with the current value.
    pub fn subscribe(&self) -> StatusObserver {
        self.status.observe()
    }

    /// [`subscribe`](Self::subscribe), or `None` once `max` observers are
    /// registered.
    pub fn try_subscribe(&self, max: u32) -> Option<StatusObserver> {
        self.status.try_observe(max)
    }

    pub fn is_connected(&self) -> bool {
        self.status.latest()
    }

    pub fn status(&self) -> &StatusBroadcaster {
        &self.status
    }
}
