//! Controller WebSocket lifecycle: handshake, then the authenticated loop.
//!
//! A new socket must deliver a valid `{"token", "hmac"}` message within the
//! auth window or it is closed without a reply. Once accepted it is attached
//! to the registry and one loop owns it until it ends: outbound commands,
//! inbound replies, liveness probes and eviction all run through the same
//! `select!`, so every timer of the session dies with the loop.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, info_span, warn, Instrument};

use super::liveness::{Liveness, TickAction};
use super::session::{CloseReason, ControllerSession, SessionChannels};
use super::{Handshake, TunnelState};
use crate::credential::{unix_now, Credential, CredentialError, CredentialValidator};

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    AuthTimeout(Duration),
    #[error("connection closed before handshake")]
    Disconnected,
    #[error("handshake message is not valid JSON with token and hmac")]
    InvalidMessage,
    #[error("credential rejected: {0}")]
    Rejected(#[from] CredentialError),
}

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(1);

/// How an authenticated session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// The controller closed the socket or the read side failed.
    RemoteClosed,
    /// The relay closed it (eviction or shutdown).
    Closed(CloseReason),
    /// A liveness probe went unanswered.
    ProbeTimeout,
    /// Writing to the socket failed.
    WriteFailed,
}

/// Tunnel endpoint: any path upgrades to the controller WebSocket.
pub async fn controller_upgrade(
    State(state): State<TunnelState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> Response {
    info!(%peer, "Incoming controller connection");
    ws.on_upgrade(move |socket| {
        handle_controller_ws(socket, state).instrument(info_span!("controller", %peer))
    })
}

/// Wait for the first application message and validate it as a handshake.
/// Ping/pong frames before it are skipped.
pub async fn await_handshake<S>(
    stream: &mut S,
    validator: &CredentialValidator,
    timeout: Duration,
) -> Result<Credential, HandshakeError>
where
    S: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let deadline = Instant::now() + timeout;
    loop {
        let msg = match tokio::time::timeout_at(deadline, stream.next()).await {
            Err(_) => return Err(HandshakeError::AuthTimeout(timeout)),
            Ok(None | Some(Err(_))) => return Err(HandshakeError::Disconnected),
            Ok(Some(Ok(msg))) => msg,
        };
        match msg {
            Message::Text(text) => return check_handshake(text.as_str(), validator, unix_now()),
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => return Err(HandshakeError::Disconnected),
            Message::Binary(_) => return Err(HandshakeError::InvalidMessage),
        }
    }
}

fn check_handshake(
    text: &str,
    validator: &CredentialValidator,
    now: u64,
) -> Result<Credential, HandshakeError> {
    let handshake: Handshake =
        serde_json::from_str(text).map_err(|_| HandshakeError::InvalidMessage)?;
    let (Some(token), Some(hmac)) = (
        handshake.token.filter(|t| !t.is_empty()),
        handshake.hmac.filter(|h| !h.is_empty()),
    ) else {
        return Err(HandshakeError::InvalidMessage);
    };
    debug!(token = %token, "Handshake attempt");
    Ok(validator.validate(&token, &hmac, now)?)
}

/// Drive one controller socket from accept to close.
pub async fn handle_controller_ws(socket: WebSocket, state: TunnelState) {
    let (mut sink, mut stream) = socket.split();

    let credential =
        match await_handshake(&mut stream, &state.validator, state.timings.auth_timeout).await {
            Ok(c) => c,
            Err(e) => {
                warn!("Controller handshake failed: {e}");
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        };

    let (session, channels) = ControllerSession::new(state.next_session_id(), credential.device_id);
    let session = Arc::new(session);
    let span = info_span!("session", session_id = session.id, device_id = %session.device_id);

    async {
        info!("Controller authenticated");
        state.registry.attach(session.clone()).await;

        let end = run_session(&mut sink, &mut stream, &state, &session, channels).await;

        let was_current = state.registry.detach(&session).await;
        let abandoned = state.relay.abandon(session.id);
        info!(?end, was_current, abandoned, "Controller session ended");

        match end {
            SessionEnd::Closed(_) => {
                let _ = sink.send(Message::Close(None)).await;
            }
            // Abortive: drop the socket without a close handshake.
            SessionEnd::ProbeTimeout => warn!("Terminating unresponsive controller"),
            SessionEnd::RemoteClosed | SessionEnd::WriteFailed => {}
        }
    }
    .instrument(span)
    .await;
}

/// The authenticated loop. Returns when the session must end.
pub async fn run_session<Si, St>(
    sink: &mut Si,
    stream: &mut St,
    state: &TunnelState,
    session: &ControllerSession,
    channels: SessionChannels,
) -> SessionEnd
where
    Si: Sink<Message> + Unpin,
    St: Stream<Item = Result<Message, axum::Error>> + Unpin,
{
    let SessionChannels {
        mut outbound_rx,
        mut close_rx,
    } = channels;

    let timings = state.timings;
    // `interval_at` panics on a zero period.
    let probe_interval = timings.probe_interval.max(MIN_PROBE_INTERVAL);
    let start = Instant::now();
    let mut liveness = Liveness::new(start);
    let mut probe_timer = tokio::time::interval_at(start + probe_interval, probe_interval);
    probe_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut grace_deadline: Option<Instant> = None;

    loop {
        tokio::select! {
            msg = stream.next() => {
                let Some(Ok(msg)) = msg else { return SessionEnd::RemoteClosed };
                match msg {
                    Message::Text(text) => {
                        state.relay.accept_reply(session.id, text.as_str());
                    }
                    Message::Pong(_) => {
                        let now = Instant::now();
                        if let Some(rtt) = liveness.on_pong(now) {
                            debug!(rtt_ms = rtt.as_millis(), "Probe answered");
                        }
                        session.record_pong(now);
                        grace_deadline = None;
                    }
                    Message::Close(_) => return SessionEnd::RemoteClosed,
                    Message::Binary(data) => {
                        warn!(len = data.len(), "Ignoring binary frame from controller");
                    }
                    Message::Ping(_) => {}
                }
            }
            Some(text) = outbound_rx.recv() => {
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return SessionEnd::WriteFailed;
                }
            }
            changed = close_rx.changed() => {
                let reason = *close_rx.borrow();
                match (changed, reason) {
                    (_, Some(reason)) => return SessionEnd::Closed(reason),
                    // Sender gone without a reason: the handle was dropped.
                    (Err(_), None) => return SessionEnd::Closed(CloseReason::Shutdown),
                    (Ok(()), None) => {}
                }
            }
            _ = probe_timer.tick() => {
                let now = Instant::now();
                match liveness.on_tick(now) {
                    TickAction::SendProbe => {
                        if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                            return SessionEnd::WriteFailed;
                        }
                        session.mark_probe_sent();
                        grace_deadline = Some(now + timings.probe_grace);
                    }
                    TickAction::Terminate => {
                        warn!("Previous probe still unanswered at next tick");
                        return SessionEnd::ProbeTimeout;
                    }
                }
            }
            () = tokio::time::sleep_until(grace_deadline.unwrap_or(start)), if grace_deadline.is_some() => {
                grace_deadline = None;
                if liveness.on_grace_expired() {
                    warn!(
                        missed = liveness.missed(),
                        since_last_pong_ms = liveness.last_pong().elapsed().as_millis(),
                        "Probe grace expired"
                    );
                    return SessionEnd::ProbeTimeout;
                }
            }
        }
    }
}
