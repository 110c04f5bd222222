//! Wake command relay: single-flight request/response over the tunnel.
//!
//! [`CommandRelay::issue_wake`] sends `{"mac", "id"}` to whichever controller
//! session is currently registered and waits for the matching reply. Exactly
//! one resolution reaches the caller: the reply, an invalid-reply failure, a
//! timeout, or a disconnect. Replies that arrive after resolution find an
//! empty slot and are dropped.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

use super::registry::TunnelRegistry;
use super::WakeCommand;

/// Default time a controller has to answer a wake command.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("no controller connected")]
    NoController,
    #[error("a command is already in flight")]
    AlreadyInFlight,
    #[error("controller did not respond in time")]
    Timeout,
    #[error("controller disconnected before replying")]
    ControllerDisconnected,
    #[error("controller sent an invalid response")]
    InvalidControllerResponse,
}

/// What happened to an inbound controller message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyDisposition {
    /// Resolved the in-flight command (successfully or as invalid).
    Resolved,
    /// Carried an `id` that does not match the in-flight command.
    Mismatched,
    /// Nothing was in flight for this session.
    Unsolicited,
}

struct PendingCommand {
    id: String,
    session_id: u64,
    mac: String,
    created_at: Instant,
    deadline: Instant,
    reply_tx: oneshot::Sender<Result<Value, CommandError>>,
}

/// Snapshot of the in-flight command, for status reporting.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub id: String,
    pub mac: String,
    pub age: Duration,
    pub remaining: Duration,
}

type Slot = Mutex<Option<PendingCommand>>;

#[derive(Clone)]
pub struct CommandRelay {
    registry: TunnelRegistry,
    // std Mutex: only held for swaps, and released from `Drop`.
    pending: Arc<Slot>,
    timeout: Duration,
}

fn lock(slot: &Slot) -> MutexGuard<'_, Option<PendingCommand>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Frees the slot if the command it was created for still holds it.
struct PendingGuard<'a> {
    slot: &'a Slot,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let mut slot = lock(self.slot);
        if slot.as_ref().is_some_and(|p| p.id == self.id) {
            *slot = None;
        }
    }
}

impl CommandRelay {
    pub fn new(registry: TunnelRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            pending: Arc::new(Mutex::new(None)),
            timeout,
        }
    }

    pub fn in_flight(&self) -> Option<InFlight> {
        let now = Instant::now();
        lock(&self.pending).as_ref().map(|p| InFlight {
            id: p.id.clone(),
            mac: p.mac.clone(),
            age: now.saturating_duration_since(p.created_at),
            remaining: p.deadline.saturating_duration_since(now),
        })
    }

    /// Send a wake command for `mac` to the current controller and wait for
    /// its reply.
    pub async fn issue_wake(&self, mac: &str) -> Result<Value, CommandError> {
        let session = self
            .registry
            .current()
            .await
            .ok_or(CommandError::NoController)?;

        let id = uuid::Uuid::new_v4().to_string();
        let created_at = Instant::now();
        let deadline = created_at + self.timeout;
        let (reply_tx, reply_rx) = oneshot::channel();
        {
            let mut slot = lock(&self.pending);
            if slot.is_some() {
                return Err(CommandError::AlreadyInFlight);
            }
            *slot = Some(PendingCommand {
                id: id.clone(),
                session_id: session.id,
                mac: mac.to_string(),
                created_at,
                deadline,
                reply_tx,
            });
        }
        let _guard = PendingGuard {
            slot: &self.pending,
            id: id.clone(),
        };

        let payload = serde_json::to_string(&WakeCommand {
            mac: mac.to_string(),
            id: Some(id.clone()),
        })
        .map_err(|_| CommandError::InvalidControllerResponse)?;
        info!(
            command_id = %id,
            session_id = session.id,
            mac,
            "Sending wake command to controller"
        );

        let outcome = tokio::time::timeout_at(deadline, async {
            session
                .send(payload)
                .await
                .map_err(|_| CommandError::ControllerDisconnected)?;
            reply_rx
                .await
                .unwrap_or(Err(CommandError::ControllerDisconnected))
        })
        .await
        .unwrap_or(Err(CommandError::Timeout));

        match &outcome {
            Ok(_) => info!(
                command_id = %id,
                elapsed_ms = created_at.elapsed().as_millis(),
                "Wake command acknowledged"
            ),
            Err(e) => warn!(command_id = %id, "Wake command failed: {e}"),
        }
        outcome
    }

    /// Offer an inbound text message from session `session_id` as the reply
    /// to the in-flight command.
    ///
    /// A reply whose `id` field differs from the in-flight command's id is
    /// dropped and the command keeps waiting. A reply without a string `id`
    /// is taken as the answer, for controllers that do not echo ids.
    pub fn accept_reply(&self, session_id: u64, text: &str) -> ReplyDisposition {
        let mut slot = lock(&self.pending);
        let Some(pending) = slot.as_ref().filter(|p| p.session_id == session_id) else {
            warn!(session_id, "Controller message with no command in flight (dropped)");
            return ReplyDisposition::Unsolicited;
        };

        let outcome = match serde_json::from_str::<Value>(text) {
            Ok(reply) => {
                // Only a string `id` is a correlation tag; `null` or numbers
                // count as absent.
                if let Some(reply_id) = reply.get("id").and_then(Value::as_str) {
                    if reply_id != pending.id {
                        warn!(
                            session_id,
                            command_id = %pending.id,
                            reply_id = %reply_id,
                            "Controller reply for another command (dropped)"
                        );
                        return ReplyDisposition::Mismatched;
                    }
                }
                Ok(reply)
            }
            Err(e) => {
                warn!(session_id, "Unparsable controller reply: {e}");
                Err(CommandError::InvalidControllerResponse)
            }
        };

        if let Some(pending) = slot.take() {
            // The caller may have given up already; nothing to do then.
            let _ = pending.reply_tx.send(outcome);
        }
        ReplyDisposition::Resolved
    }

    /// Fail the in-flight command if it was sent over session `session_id`.
    pub fn abandon(&self, session_id: u64) -> bool {
        let mut slot = lock(&self.pending);
        if !slot.as_ref().is_some_and(|p| p.session_id == session_id) {
            return false;
        }
        if let Some(pending) = slot.take() {
            let _ = pending
                .reply_tx
                .send(Err(CommandError::ControllerDisconnected));
        }
        true
    }
}
